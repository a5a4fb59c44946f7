//! Async plugin surface called by the UI
//!
//! Every method is an exception boundary: failures come back as an
//! [`Error`] whose message is the rejection string, never as a panic.
//! Blocking work runs on tokio's blocking pool.

use crate::cache::RenderCache;
use crate::job::RenderJob;
use crate::platform::Platform;
use crate::queue::{JobQueue, QueueEvent};
use crate::rendering::canvas::CanvasRenderer;
use crate::rendering::worker::{RenderComplete, RenderImageRequest, RenderWorker, WorkerRequest, WorkerResponse};
use crate::rendering::{self, HostCapability, HtmlRenderer};
use crate::service::{BootResume, RenderingService, ResumeOutcome, ServiceEvent};
use crate::{Error, RenderConfig, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress and completion signals delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RenderEvent {
    #[serde(rename_all = "camelCase")]
    Progress { current: usize, total: usize, item: String },
    #[serde(rename_all = "camelCase")]
    Complete { file_name: String, path: Option<PathBuf> },
    #[serde(rename_all = "camelCase")]
    Failed { file_name: String, error: String },
    Cancelled,
}

pub type EventListener = Arc<dyn Fn(&RenderEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningStatus {
    pub is_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub render_jobs: Vec<RenderJob>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReply {
    pub job_count: usize,
    pub message: String,
}

type Listeners = Arc<Mutex<Vec<EventListener>>>;

fn broadcast(listeners: &Listeners, event: RenderEvent) {
    let snapshot = match listeners.lock() {
        Ok(l) => l.clone(),
        Err(_) => return,
    };
    for l in snapshot {
        l(&event);
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Other(format!("Background task failed: {}", e))
}

pub struct Bridge {
    platform: Platform,
    config: RenderConfig,
    queue: Arc<JobQueue>,
    service: Arc<RenderingService>,
    cache: Arc<RenderCache>,
    worker: Mutex<Option<Arc<RenderWorker>>>,
    listeners: Listeners,
}

impl Bridge {
    /// Bridge whose queue renders through the native snapshot surface
    pub fn new(platform: Platform, config: RenderConfig) -> Result<Self> {
        let renderer = rendering::select_backend(HostCapability::NativeSurface, &config)?;
        Ok(Self::with_renderer(platform, config, Arc::from(renderer)))
    }

    pub fn with_renderer(platform: Platform, config: RenderConfig, renderer: Arc<dyn HtmlRenderer>) -> Self {
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));

        let queue = Arc::new(JobQueue::open(platform.storage.clone(), &config, renderer));
        let sink = listeners.clone();
        queue.on_event(Arc::new(move |event: &QueueEvent| {
            let mapped = match event {
                QueueEvent::Completed { job, path, .. } => RenderEvent::Complete {
                    file_name: job.file_name.clone(),
                    path: Some(path.clone()),
                },
                QueueEvent::Failed { job, error, .. } => RenderEvent::Failed {
                    file_name: job.file_name.clone(),
                    error: error.clone(),
                },
                QueueEvent::Cancelled { .. } => RenderEvent::Cancelled,
                QueueEvent::Retrying { .. } => return,
            };
            broadcast(&sink, mapped);
        }));

        let service = Arc::new(RenderingService::new(
            platform.clone(),
            Arc::new(CanvasRenderer::new(&config)),
            config.clone(),
        ));
        let sink = listeners.clone();
        service.on_event(Arc::new(move |event: &ServiceEvent| {
            let mapped = match event {
                ServiceEvent::Progress { current, total, item } => RenderEvent::Progress {
                    current: *current,
                    total: *total,
                    item: item.clone(),
                },
                ServiceEvent::Complete => RenderEvent::Complete {
                    file_name: String::new(),
                    path: None,
                },
                ServiceEvent::Error(e) => RenderEvent::Failed {
                    file_name: String::new(),
                    error: e.clone(),
                },
                ServiceEvent::Cancelled => RenderEvent::Cancelled,
            };
            broadcast(&sink, mapped);
        }));

        Self {
            cache: Arc::new(RenderCache::new(platform.storage.clone())),
            platform,
            config,
            queue,
            service,
            worker: Mutex::new(None),
            listeners,
        }
    }

    pub fn on_event(&self, listener: EventListener) {
        if let Ok(mut l) = self.listeners.lock() {
            l.push(listener);
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Start the legacy batch service from `{renderData: {...}}`
    pub async fn start_rendering(&self, options: serde_json::Value) -> Result<StatusReply> {
        let data = options
            .get("renderData")
            .filter(|d| !d.is_null())
            .ok_or_else(|| Error::InvalidInput("Render data is required".into()))?;
        let raw = data.to_string();
        match self.service.start(&raw) {
            Ok(session) => {
                info!("Background rendering session {} started ({} items)", session.id, session.total);
                Ok(StatusReply {
                    success: true,
                    message: "Background rendering started".into(),
                })
            }
            Err(Error::AlreadyRunning) => Err(Error::AlreadyRunning),
            Err(e) => Err(Error::Other(format!("Failed to start rendering service: {}", e))),
        }
    }

    pub async fn stop_rendering(&self) -> Result<StatusReply> {
        self.service.stop();
        Ok(StatusReply {
            success: true,
            message: "Background rendering stopped".into(),
        })
    }

    pub async fn get_status(&self) -> RunningStatus {
        RunningStatus {
            is_running: self.service.is_running(),
        }
    }

    /// Enqueue one HTML job and make sure the queue worker is draining
    pub async fn render(&self, request: RenderRequest) -> Result<()> {
        let (Some(html), Some(file_name)) = (request.html, request.file_name) else {
            return Err(Error::InvalidInput("html or fileName missing".into()));
        };
        let folder = request.folder_name.unwrap_or_else(|| self.config.default_folder.clone());
        let job = RenderJob::new(html, file_name).in_folder(folder);
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            queue.enqueue(job)?;
            queue.start()
        })
        .await
        .map_err(join_error)??;
        Ok(())
    }

    /// Enqueue every valid job of a batch into one folder and start draining
    pub async fn render_batch(&self, request: BatchRequest) -> Result<BatchReply> {
        let folder = request.folder_name.unwrap_or_else(|| self.config.default_folder.clone());
        let queue = self.queue.clone();
        let count = tokio::task::spawn_blocking(move || {
            let count = queue.enqueue_batch(request.render_jobs, Some(&folder))?;
            queue.start().map(|_| count)
        })
        .await
        .map_err(join_error)??;
        Ok(BatchReply {
            job_count: count,
            message: format!("{} render jobs enqueued", count),
        })
    }

    /// Resume persisted jobs and start draining the queue
    pub async fn start_background_rendering(&self) -> Result<ResumeOutcome> {
        let queue = self.queue.clone();
        let pending = self.platform.pending_jobs();
        let outcome = tokio::task::spawn_blocking(move || {
            let outcome = BootResume::new(pending, queue.clone()).run();
            queue.start().map(|_| outcome)
        })
        .await
        .map_err(join_error)??;
        Ok(outcome)
    }

    pub async fn cancel_renders(&self) -> Result<usize> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.cancel_all())
            .await
            .map_err(join_error)
    }

    pub async fn save_pending_jobs(&self, jobs: Vec<RenderJob>) -> bool {
        let store = self.platform.pending_jobs();
        match tokio::task::spawn_blocking(move || store.save(&jobs)).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Saving pending jobs failed: {}", e);
                false
            }
        }
    }

    pub async fn pending_jobs(&self) -> Vec<RenderJob> {
        let store = self.platform.pending_jobs();
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Loading pending jobs failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Replace the web worker session, terminating the previous one
    fn fresh_worker(&self) -> Result<Arc<RenderWorker>> {
        let worker = Arc::new(RenderWorker::spawn()?);
        let mut slot = self
            .worker
            .lock()
            .map_err(|_| Error::Other("worker slot poisoned".into()))?;
        if let Some(previous) = slot.replace(worker.clone()) {
            debug!("Terminating previous worker session");
            previous.terminate();
        }
        Ok(worker)
    }

    /// Render one catalogue page in a fresh worker session and cache it
    pub async fn render_in_worker(&self, request: RenderImageRequest) -> Result<RenderComplete> {
        let worker = self.fresh_worker()?;
        worker.post(WorkerRequest::RenderImage(request))?;

        let bound = self.config.snapshot_timeout()
            + Duration::from_millis(self.config.image_timeout_ms.saturating_mul(2));
        let listeners = self.listeners.clone();
        let response = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + bound;
            loop {
                if worker.is_terminated() {
                    return Err(Error::Cancelled);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout(bound.as_millis() as u64));
                }
                match worker.recv_timeout(remaining.min(Duration::from_millis(100))) {
                    Some(WorkerResponse::Progress(p)) => {
                        broadcast(&listeners, RenderEvent::Progress { current: 0, total: 1, item: p.product_id });
                    }
                    Some(WorkerResponse::Cancelled) => return Err(Error::Cancelled),
                    Some(other) => return Ok(other),
                    None => {}
                }
            }
        })
        .await
        .map_err(join_error)??;

        match response {
            WorkerResponse::RenderComplete(done) => {
                self.cache.put(&done.catalogue_label, &done.product_id, &done.base64);
                let file = crate::cache::export_file_name(&done.catalogue_label, &done.product_id);
                let saved = !done.catalogue_label.is_empty()
                    && self.platform.storage.save_base64(&done.catalogue_label, &file, &done.base64);
                if !saved {
                    warn!("Rendered {} kept in cache only", done.product_id);
                }
                broadcast(
                    &self.listeners,
                    RenderEvent::Complete {
                        file_name: file.clone(),
                        path: saved.then(|| self.platform.storage.artifact_path(&done.catalogue_label, &file)),
                    },
                );
                Ok(done)
            }
            WorkerResponse::RenderError(failure) => {
                broadcast(
                    &self.listeners,
                    RenderEvent::Failed {
                        file_name: failure.product_id.clone(),
                        error: failure.error.clone(),
                    },
                );
                Err(Error::RenderError(failure.error))
            }
            _ => Err(Error::Other("Unexpected worker response".into())),
        }
    }

    /// Ask the current worker session to stop accepting work
    pub async fn cancel_worker(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .map_err(|_| Error::Other("worker slot poisoned".into()))?
            .clone();
        match worker {
            Some(w) => w.post(WorkerRequest::Cancel),
            None => Ok(()),
        }
    }

    /// Stop the queue worker and any worker session
    pub fn shutdown(&self) {
        self.queue.shutdown();
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(w) = slot.take() {
                w.terminate();
            }
        }
    }
}
