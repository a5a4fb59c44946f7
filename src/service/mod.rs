//! Long-running services: the foreground batch service and boot resume

pub mod foreground;
pub mod resume;
pub mod task;

pub use foreground::{RenderSession, RenderingService, ServiceEvent, ServiceListener};
pub use resume::{BootResume, ResumeOutcome};
pub use task::{CancellationToken, RenderingTask, TaskCallback, TaskState};
