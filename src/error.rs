//! Error types for the rendering pipeline

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while accepting, rendering or persisting a job
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed request fields (rejected before any work starts)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A source image could not be decoded
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Composition or encoding failed
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// A bounded wait expired
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The storage accessor reported a failed write/read
    #[error("Storage error: {0}")]
    Storage(String),

    /// The durable queue could not persist or schedule a unit
    #[error("Queue error: {0}")]
    Queue(String),

    /// JSON payload could not be parsed or produced
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A rendering session is already active
    #[error("A rendering session is already running")]
    AlreadyRunning,

    /// The operation was cancelled cooperatively
    #[error("Rendering cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::RenderError(err.to_string())
    }
}

/// Text carried by a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run `f` and report a panic inside it as [`Error::RenderError`], so the
/// long-lived thread calling it keeps serving
pub(crate) fn catch_panic<T>(context: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(payload) => Err(Error::RenderError(format!(
            "{} panicked: {}",
            context,
            panic_message(payload.as_ref())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_become_render_errors() {
        let err = catch_panic::<()>("Snapshot", || panic!("boom")).unwrap_err();
        assert_eq!(err.to_string(), "Rendering failed: Snapshot panicked: boom");
        let owned = catch_panic::<()>("Job", || panic!("{} bad", 3)).unwrap_err();
        assert!(owned.to_string().contains("3 bad"));
        assert_eq!(catch_panic("ok", || Ok(5)).unwrap(), 5);
    }
}
