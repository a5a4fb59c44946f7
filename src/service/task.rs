//! The legacy batch loop
//!
//! A task parses one `renderData` payload and renders its items one by one
//! into the `rendered` folder. Cancellation is cooperative: the token is
//! checked once before each item, so an in-flight item always finishes.

use crate::job::RenderBatch;
use crate::rendering::ItemRenderer;
use crate::storage::Storage;
use crate::{Error, Result, LEGACY_FOLDER};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a task is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error(String),
}

/// Observer of a running task
pub trait TaskCallback: Send + Sync {
    fn on_progress(&self, current: usize, total: usize, item_name: &str);
    fn on_complete(&self);
    fn on_error(&self, message: &str);
}

pub struct RenderingTask {
    storage: Storage,
    renderer: Arc<dyn ItemRenderer>,
    render_data: String,
    throttle: Duration,
    token: CancellationToken,
    state: TaskState,
    rendered: usize,
}

impl RenderingTask {
    pub fn new(storage: Storage, renderer: Arc<dyn ItemRenderer>, render_data: impl Into<String>, throttle: Duration) -> Self {
        Self {
            storage,
            renderer,
            render_data: render_data.into(),
            throttle,
            token: CancellationToken::new(),
            state: TaskState::Idle,
            rendered: 0,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Items written so far
    pub fn rendered(&self) -> usize {
        self.rendered
    }

    /// Run the whole batch on the current thread
    pub fn run(&mut self, callback: &dyn TaskCallback) -> TaskState {
        debug!("Starting rendering task");
        self.state = TaskState::Running;
        self.state = match self.render_all(callback) {
            Ok(true) => {
                callback.on_complete();
                TaskState::Complete
            }
            Ok(false) => {
                info!("Rendering task cancelled after {} items", self.rendered);
                TaskState::Cancelled
            }
            Err(e) => {
                error!("Rendering error: {}", e);
                let message = e.to_string();
                callback.on_error(&message);
                TaskState::Error(message)
            }
        };
        self.state.clone()
    }

    /// `Ok(false)` when the batch stopped because of cancellation
    fn render_all(&mut self, callback: &dyn TaskCallback) -> Result<bool> {
        let batch = RenderBatch::from_json(&self.render_data)?;
        let total = batch.len();
        let ext = batch.output.format.extension();

        for (index, item) in batch.items.iter().enumerate() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            callback.on_progress(index + 1, total, &item.name);

            let artifact = self.renderer.render_item(item, &batch.output)?;
            let file = format!("{}.{}", item.id, ext);
            if !self.storage.write(LEGACY_FOLDER, &file, &artifact.bytes) {
                return Err(Error::Storage(format!("Failed to write {}/{}", LEGACY_FOLDER, file)));
            }
            self.rendered += 1;
            debug!("Rendered: {}", self.storage.artifact_path(LEGACY_FOLDER, &file).display());

            std::thread::sleep(self.throttle);
        }
        Ok(!self.token.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::canvas::CanvasRenderer;
    use crate::RenderConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(usize, usize, String)>>,
        completed: AtomicBool,
        error: Mutex<Option<String>>,
    }

    impl TaskCallback for Recorder {
        fn on_progress(&self, current: usize, total: usize, item_name: &str) {
            self.progress.lock().unwrap().push((current, total, item_name.to_string()));
        }

        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }

        fn on_error(&self, message: &str) {
            *self.error.lock().unwrap() = Some(message.to_string());
        }
    }

    fn task(dir: &std::path::Path, data: &str) -> RenderingTask {
        RenderingTask::new(
            Storage::new(dir),
            Arc::new(CanvasRenderer::new(&RenderConfig::default())),
            data,
            Duration::ZERO,
        )
    }

    #[test]
    fn batch_writes_one_file_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let data = r#"{"items":[{"id":"a","name":"One"},{"id":"b","name":"Two"}],"format":"jpeg","width":100,"height":100}"#;
        let mut t = task(dir.path(), data);
        let rec = Recorder::default();
        assert_eq!(t.run(&rec), TaskState::Complete);
        assert!(rec.completed.load(Ordering::SeqCst));
        assert_eq!(
            Storage::new(dir.path()).list(LEGACY_FOLDER),
            vec!["a.jpg".to_string(), "b.jpg".to_string()]
        );
        assert_eq!(rec.progress.lock().unwrap()[1], (2, 2, "Two".to_string()));
    }

    #[test]
    fn invalid_payload_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = task(dir.path(), "{not json");
        let rec = Recorder::default();
        assert!(matches!(t.run(&rec), TaskState::Error(_)));
        assert!(rec.error.lock().unwrap().is_some());
        assert!(!rec.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn pre_cancelled_task_renders_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = task(dir.path(), r#"{"items":[{"id":"a","name":"One"}]}"#);
        t.cancel();
        let rec = Recorder::default();
        assert_eq!(t.run(&rec), TaskState::Cancelled);
        assert_eq!(t.rendered(), 0);
        assert!(!rec.completed.load(Ordering::SeqCst));
    }
}
