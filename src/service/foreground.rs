//! Foreground rendering service
//!
//! Owns at most one legacy batch session at a time. The service enters the
//! foreground (ongoing notification) before any work starts, updates the
//! notification per item and stops itself a few seconds after the batch
//! completes or fails.

use crate::error::panic_message;
use crate::job::RenderBatch;
use crate::platform::{Notification, Platform};
use crate::rendering::ItemRenderer;
use crate::service::task::{CancellationToken, RenderingTask, TaskCallback, TaskState};
use crate::{Error, RenderConfig, Result};
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TITLE_RUNNING: &str = "Rendering in progress";

/// Lifecycle notifications of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Progress { current: usize, total: usize, item: String },
    Complete,
    Error(String),
    Cancelled,
}

pub type ServiceListener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

struct ActiveSession {
    id: u64,
    token: CancellationToken,
}

/// Handle to a running batch
#[derive(Debug)]
pub struct RenderSession {
    pub id: u64,
    pub total: usize,
    token: CancellationToken,
    handle: Option<JoinHandle<TaskState>>,
}

impl RenderSession {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Block until the session's thread has finished (including auto-stop)
    pub fn wait(mut self) -> TaskState {
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(state)) => state,
            Some(Err(_)) => TaskState::Error("rendering thread panicked".into()),
            None => TaskState::Idle,
        }
    }
}

struct ServiceCallback {
    platform: Platform,
    listeners: Vec<ServiceListener>,
}

impl ServiceCallback {
    fn emit(&self, event: ServiceEvent) {
        for l in &self.listeners {
            l(&event);
        }
    }
}

impl TaskCallback for ServiceCallback {
    fn on_progress(&self, current: usize, total: usize, item_name: &str) {
        self.platform.notifier.update(&Notification::new(
            TITLE_RUNNING,
            format!("Processing item {} of {}", current, total),
            current as u32,
            total as u32,
        ));
        self.emit(ServiceEvent::Progress {
            current,
            total,
            item: item_name.to_string(),
        });
    }

    fn on_complete(&self) {
        self.platform.notifier.update(&Notification::new(
            "Rendering complete",
            "All items processed successfully",
            100,
            100,
        ));
        self.emit(ServiceEvent::Complete);
    }

    fn on_error(&self, message: &str) {
        self.platform
            .notifier
            .update(&Notification::new("Rendering failed", message, 0, 100));
        self.emit(ServiceEvent::Error(message.to_string()));
    }
}

pub struct RenderingService {
    platform: Platform,
    renderer: Arc<dyn ItemRenderer>,
    config: RenderConfig,
    session: Arc<Mutex<Option<ActiveSession>>>,
    listeners: Mutex<Vec<ServiceListener>>,
    next_id: AtomicU64,
}

impl RenderingService {
    pub fn new(platform: Platform, renderer: Arc<dyn ItemRenderer>, config: RenderConfig) -> Self {
        Self {
            platform,
            renderer,
            config,
            session: Arc::new(Mutex::new(None)),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on_event(&self, listener: ServiceListener) {
        if let Ok(mut l) = self.listeners.lock() {
            l.push(listener);
        }
    }

    /// Start a batch session from a `renderData` JSON payload
    ///
    /// Rejected with [`Error::AlreadyRunning`] while another session is
    /// active.
    pub fn start(&self, render_data: &str) -> Result<RenderSession> {
        let batch = RenderBatch::from_json(render_data)
            .map_err(|e| Error::InvalidInput(format!("Invalid render data: {}", e)))?;
        let total = batch.len();
        if total == 0 {
            warn!("No render data provided, not starting");
            return Err(Error::InvalidInput("No render data provided".into()));
        }

        let mut slot = self
            .session
            .lock()
            .map_err(|_| Error::Other("session lock poisoned".into()))?;
        if slot.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();

        self.platform.notifier.start_foreground(&Notification::new(
            TITLE_RUNNING,
            format!("Processing {} items...", total),
            0,
            total as u32,
        ));
        info!("Foreground service started, beginning render task with {} items", total);

        let mut task = RenderingTask::new(
            self.platform.storage.clone(),
            self.renderer.clone(),
            render_data,
            self.config.item_throttle(),
        )
        .with_token(token.clone());
        let callback = ServiceCallback {
            platform: self.platform.clone(),
            listeners: self.listeners.lock().map(|l| l.clone()).unwrap_or_default(),
        };
        let complete_delay = Duration::from_millis(self.config.complete_stop_delay_ms);
        let error_delay = Duration::from_millis(self.config.error_stop_delay_ms);
        let session = self.session.clone();

        let handle = thread::Builder::new()
            .name(format!("catrender-batch-{}", id))
            .spawn(move || {
                // the slot must be released and the foreground stopped on every path
                let state = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&callback))) {
                    Ok(state) => state,
                    Err(payload) => {
                        let message = format!("Rendering failed: {}", panic_message(payload.as_ref()));
                        error!("Rendering session {} panicked: {}", id, message);
                        callback.on_error(&message);
                        TaskState::Error(message)
                    }
                };
                match &state {
                    TaskState::Complete => thread::sleep(complete_delay),
                    TaskState::Error(_) => thread::sleep(error_delay),
                    TaskState::Cancelled => callback.emit(ServiceEvent::Cancelled),
                    _ => {}
                }
                callback.platform.notifier.stop_foreground();
                if let Ok(mut slot) = session.lock() {
                    if slot.as_ref().map(|s| s.id) == Some(id) {
                        *slot = None;
                    }
                }
                debug!("Rendering session {} finished: {:?}", id, state);
                state
            })
            .map_err(|e| Error::Other(format!("Failed to start rendering thread: {}", e)))?;

        *slot = Some(ActiveSession {
            id,
            token: token.clone(),
        });

        Ok(RenderSession {
            id,
            total,
            token,
            handle: Some(handle),
        })
    }

    /// Ask the active session to stop after its current item
    pub fn stop(&self) -> bool {
        match self.session.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(active) => {
                    active.token.cancel();
                    info!("Stopping rendering session {}", active.id);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}
