//! CatShare rendering pipeline
//!
//! Turns catalogue render requests into encoded images on device storage and
//! reports completion back to the caller, even when the page that asked for
//! the render is long gone.
//!
//! # Features
//!
//! - **Three backends, one interface**: the legacy Canvas renderer, the
//!   WebView-style snapshot renderer and the Worker renderer all produce an
//!   [`rendering::Artifact`]
//! - **Durable queue**: jobs are persisted before `enqueue` returns and are
//!   retried with backoff until they succeed or exhaust their attempts
//! - **Cooperative cancellation**: batches observe a cancellation token
//!   between items, never in the middle of one
//! - **`cdp`**: an optional Chrome-backed snapshot surface
//!
//! # Example
//!
//! ```no_run
//! use catrender::{job::RenderJob, rendering, storage::Storage, RenderConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RenderConfig {
//!     files_dir: "/tmp/catshare".into(),
//!     ..Default::default()
//! };
//! let storage = Storage::new(&config.files_dir);
//! let renderer = rendering::select_backend(rendering::HostCapability::NativeSurface, &config)?;
//! let job = RenderJob::new("<h1>Blue Teddy</h1>", "teddy.png");
//! let artifact = renderer.render(&job)?;
//! storage.write(&job.folder_name, &job.file_name, &artifact.bytes);
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod job;
pub mod storage;

// Host collaborators: preference store and notifications
pub mod platform;

pub mod rendering;

// Chrome DevTools backed snapshot surface
#[cfg(feature = "cdp")]
pub mod cdp;

pub mod cache;
pub mod queue;
pub mod service;

// Async plugin surface called by the UI collaborator
pub mod bridge;

pub use job::{LegacyRenderItem, OutputFormat, RenderBatch, RenderJob};
pub use rendering::{Artifact, HtmlRenderer, ItemRenderer};
pub use storage::Storage;

/// Folder used by the snapshot path and the queue when a job names none
pub const DEFAULT_FOLDER: &str = "renders";

/// Folder the legacy batch path writes into
pub const LEGACY_FOLDER: &str = "rendered";

/// Configuration for the rendering pipeline
///
/// All heuristic timing constants live here rather than inline so hosts can
/// tune them. The defaults mirror the behaviour of the shipping app:
/// - snapshots are 1080px wide with a 500ms settle delay and a 10s bound
/// - the legacy batch sleeps 100ms between items
/// - the foreground service stops itself 3s after completion, 5s after an error
///
/// # Examples
///
/// ```
/// let cfg = catrender::RenderConfig::default();
/// assert_eq!(cfg.snapshot_width, 1080);
/// assert_eq!(cfg.default_folder, "renders");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Root directory standing in for the app's external files dir
    pub files_dir: PathBuf,
    /// Folder used when a job does not name one
    pub default_folder: String,
    /// Fixed layout width of the snapshot surface
    pub snapshot_width: u32,
    /// Minimum snapshot height when content is shorter
    pub snapshot_min_height: u32,
    /// Delay after load-finished before rasterizing, in milliseconds
    pub settle_delay_ms: u64,
    /// Upper bound on the wait for the surface thread, in milliseconds
    pub snapshot_timeout_ms: u64,
    /// Pause between legacy batch items, in milliseconds
    pub item_throttle_ms: u64,
    /// Foreground service auto-stop delay after completion
    pub complete_stop_delay_ms: u64,
    /// Foreground service auto-stop delay after an error
    pub error_stop_delay_ms: u64,
    /// Per-image load timeout in the worker renderer
    pub image_timeout_ms: u64,
    /// JPEG encoder quality (1-100)
    pub jpeg_quality: u8,
    /// Attempts before the durable queue gives up on a unit
    pub queue_max_attempts: u32,
    /// Base of the exponential retry backoff, in milliseconds
    pub queue_backoff_ms: u64,
    /// Device pixel scale used by the worker renderer
    pub worker_scale: u32,
    /// Watermark drawn on legacy items when no watermark config is supplied
    pub watermark_text: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("files"),
            default_folder: DEFAULT_FOLDER.to_string(),
            snapshot_width: 1080,
            snapshot_min_height: 600,
            settle_delay_ms: 500,
            snapshot_timeout_ms: 10_000,
            item_throttle_ms: 100,
            complete_stop_delay_ms: 3000,
            error_stop_delay_ms: 5000,
            image_timeout_ms: 5000,
            jpeg_quality: 90,
            queue_max_attempts: 5,
            queue_backoff_ms: 60_000,
            worker_scale: 3,
            watermark_text: "Created using CatShare".to_string(),
        }
    }
}

impl RenderConfig {
    /// Load a configuration from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidInput(format!("Failed to read config {}: {}", path.as_ref().display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn item_throttle(&self) -> Duration {
        Duration::from_millis(self.item_throttle_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RenderConfig::default();
        assert_eq!(config.snapshot_width, 1080);
        assert_eq!(config.snapshot_min_height, 600);
        assert_eq!(config.snapshot_timeout_ms, 10_000);
        assert_eq!(config.jpeg_quality, 90);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: RenderConfig =
            serde_json::from_str(r#"{"settle_delay_ms": 50, "files_dir": "/tmp/x"}"#).unwrap();
        assert_eq!(config.settle_delay(), Duration::from_millis(50));
        assert_eq!(config.files_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.item_throttle_ms, 100);
    }
}
