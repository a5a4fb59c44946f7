//! Durable render queue
//!
//! Every accepted job becomes one unit file under `queue/` before `enqueue`
//! returns, so work survives the requesting process. Units are executed by
//! an [`HtmlRenderer`] and removed only once they succeed or exhaust their
//! attempts; failures are rescheduled with exponential backoff. Execution is
//! at-least-once: a crash between writing the artifact and deleting the unit
//! renders the job again.

use crate::error::catch_panic;
use crate::job::RenderJob;
use crate::rendering::HtmlRenderer;
use crate::storage::Storage;
use crate::{Error, RenderConfig, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const QUEUE_FOLDER: &str = "queue";
const UNIT_SUFFIX: &str = ".json";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUnit {
    pub key: String,
    pub job: RenderJob,
    #[serde(default)]
    pub attempts: u32,
    /// Earliest wall-clock time (ms since epoch) the unit may run again
    #[serde(default)]
    pub not_before_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Something that happened to a unit
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed { key: String, job: RenderJob, path: PathBuf },
    Retrying { key: String, job: RenderJob, attempts: u32, delay_ms: u64, error: String },
    Failed { key: String, job: RenderJob, error: String },
    Cancelled { count: usize },
}

pub type QueueListener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Key a job by its input data
pub fn unit_key(job: &RenderJob) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.folder_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(job.file_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(job.html.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn backoff_delay(base_ms: u64, attempts: u32) -> u64 {
    let exp = attempts.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << exp)
}

struct Inner {
    storage: Storage,
    renderer: Arc<dyn HtmlRenderer>,
    max_attempts: u32,
    backoff_ms: u64,
    listeners: Mutex<Vec<QueueListener>>,
    run_lock: Mutex<()>,
    shutdown: AtomicBool,
    wake: (Mutex<bool>, Condvar),
}

impl Inner {
    fn emit(&self, event: QueueEvent) {
        let listeners = match self.listeners.lock() {
            Ok(l) => l.clone(),
            Err(_) => return,
        };
        for l in listeners {
            l(&event);
        }
    }

    fn unit_file(key: &str) -> String {
        format!("{}{}", key, UNIT_SUFFIX)
    }

    fn save_unit(&self, unit: &QueueUnit) -> Result<()> {
        let bytes = serde_json::to_vec(unit)?;
        if self.storage.write(QUEUE_FOLDER, &Self::unit_file(&unit.key), &bytes) {
            Ok(())
        } else {
            Err(Error::Queue(format!("Failed to persist unit {}", unit.key)))
        }
    }

    fn load_units(&self) -> Vec<QueueUnit> {
        self.storage
            .list(QUEUE_FOLDER)
            .into_iter()
            .filter(|name| name.ends_with(UNIT_SUFFIX))
            .filter_map(|name| {
                let bytes = self.storage.read(QUEUE_FOLDER, &name)?;
                match serde_json::from_slice::<QueueUnit>(&bytes) {
                    Ok(unit) => Some(unit),
                    Err(e) => {
                        error!("Dropping unreadable queue unit {}: {}", name, e);
                        self.storage.delete(QUEUE_FOLDER, &name);
                        None
                    }
                }
            })
            .collect()
    }

    fn signal(&self) {
        let (lock, cvar) = &self.wake;
        if let Ok(mut woken) = lock.lock() {
            *woken = true;
            cvar.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) {
        let (lock, cvar) = &self.wake;
        let Ok(guard) = lock.lock() else {
            return;
        };
        if let Ok((mut woken, _)) = cvar.wait_timeout_while(guard, timeout, |w| !*w) {
            *woken = false;
        }
    }

    fn execute(&self, unit: QueueUnit) {
        let QueueUnit { key, job, .. } = &unit;
        let outcome = catch_panic("Render", || self.renderer.render(job)).and_then(|artifact| {
            if self.storage.write(&job.folder_name, &job.file_name, &artifact.bytes) {
                Ok(self.storage.artifact_path(&job.folder_name, &job.file_name))
            } else {
                Err(Error::Storage(format!("Failed to save {}/{}", job.folder_name, job.file_name)))
            }
        });

        match outcome {
            Ok(path) => {
                self.storage.delete(QUEUE_FOLDER, &Self::unit_file(key));
                info!("Rendered {} to {}", job.file_name, path.display());
                self.emit(QueueEvent::Completed {
                    key: key.clone(),
                    job: job.clone(),
                    path,
                });
            }
            Err(e) => self.record_failure(unit, e),
        }
    }

    fn record_failure(&self, mut unit: QueueUnit, err: Error) {
        unit.attempts += 1;
        let message = err.to_string();
        let file = Self::unit_file(&unit.key);

        if !self.storage.exists(QUEUE_FOLDER, &file) {
            debug!("Unit {} was cancelled while running", unit.key);
            return;
        }

        if unit.attempts >= self.max_attempts {
            error!(
                "Giving up on {} after {} attempts: {}",
                unit.job.file_name, unit.attempts, message
            );
            self.storage.delete(QUEUE_FOLDER, &file);
            self.emit(QueueEvent::Failed {
                key: unit.key,
                job: unit.job,
                error: message,
            });
            return;
        }

        let delay_ms = backoff_delay(self.backoff_ms, unit.attempts);
        unit.not_before_ms = now_ms() + delay_ms;
        unit.last_error = Some(message.clone());
        warn!(
            "Render of {} failed (attempt {}), retrying in {}ms: {}",
            unit.job.file_name, unit.attempts, delay_ms, message
        );
        if let Err(e) = self.save_unit(&unit) {
            error!("Could not reschedule {}: {}", unit.key, e);
        }
        self.emit(QueueEvent::Retrying {
            key: unit.key,
            job: unit.job,
            attempts: unit.attempts,
            delay_ms,
            error: message,
        });
    }

    fn run_pending(&self) -> usize {
        let Ok(_guard) = self.run_lock.lock() else {
            return 0;
        };
        let now = now_ms();
        let due: Vec<QueueUnit> = self
            .load_units()
            .into_iter()
            .filter(|u| u.not_before_ms <= now)
            .collect();
        let count = due.len();
        for unit in due {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.execute(unit);
        }
        count
    }
}

/// Restart-surviving queue of render jobs
pub struct JobQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Open the queue rooted in `storage`, picking up units left by earlier runs
    pub fn open(storage: Storage, config: &RenderConfig, renderer: Arc<dyn HtmlRenderer>) -> Self {
        let inner = Arc::new(Inner {
            storage,
            renderer,
            max_attempts: config.queue_max_attempts.max(1),
            backoff_ms: config.queue_backoff_ms,
            listeners: Mutex::new(Vec::new()),
            run_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            wake: (Mutex::new(false), Condvar::new()),
        });
        let recovered = inner.load_units().len();
        if recovered > 0 {
            info!("Recovered {} pending render units", recovered);
        }
        Self {
            inner,
            worker: Mutex::new(None),
        }
    }

    pub fn on_event(&self, listener: QueueListener) {
        if let Ok(mut l) = self.inner.listeners.lock() {
            l.push(listener);
        }
    }

    /// Persist one job; returns its unit key
    pub fn enqueue(&self, job: RenderJob) -> Result<String> {
        job.validate()?;
        let key = unit_key(&job);
        if self.inner.storage.exists(QUEUE_FOLDER, &Inner::unit_file(&key)) {
            debug!("Job {} already queued as {}", job.file_name, key);
            return Ok(key);
        }
        let unit = QueueUnit {
            key: key.clone(),
            job,
            attempts: 0,
            not_before_ms: 0,
            last_error: None,
        };
        self.inner.save_unit(&unit)?;
        debug!("Enqueued render unit {}", key);
        self.inner.signal();
        Ok(key)
    }

    /// Persist every valid job, optionally moving them all into `folder`
    pub fn enqueue_batch(&self, jobs: Vec<RenderJob>, folder: Option<&str>) -> Result<usize> {
        let valid: Vec<RenderJob> = jobs
            .into_iter()
            .filter(RenderJob::is_valid)
            .map(|job| match folder {
                Some(f) => job.in_folder(f),
                None => job,
            })
            .collect();
        if valid.is_empty() {
            return Err(Error::InvalidInput("No valid render jobs found".into()));
        }
        let count = valid.len();
        for job in valid {
            self.enqueue(job)?;
        }
        info!("Enqueued {} render jobs", count);
        Ok(count)
    }

    /// Drop every pending unit; returns how many were removed
    pub fn cancel_all(&self) -> usize {
        let units = self.inner.load_units();
        let count = units
            .iter()
            .filter(|u| self.inner.storage.delete(QUEUE_FOLDER, &Inner::unit_file(&u.key)))
            .count();
        info!("Cancelled {} pending render units", count);
        self.inner.emit(QueueEvent::Cancelled { count });
        count
    }

    pub fn pending(&self) -> Vec<QueueUnit> {
        self.inner.load_units()
    }

    /// Run every unit that is due once; returns how many were attempted
    pub fn run_pending(&self) -> usize {
        self.inner.run_pending()
    }

    /// Start the background worker thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| Error::Queue("queue worker lock poisoned".into()))?;
        if worker.is_some() {
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("catrender-queue".into())
            .spawn(move || {
                while !inner.shutdown.load(Ordering::SeqCst) {
                    inner.run_pending();
                    inner.wait(POLL_INTERVAL);
                }
                debug!("Queue worker exiting");
            })
            .map_err(|e| Error::Queue(format!("Failed to spawn queue worker: {}", e)))?;
        *worker = Some(handle);
        info!("Queue worker started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Stop the worker after its current unit
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.signal();
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::Artifact;
    use std::sync::atomic::AtomicUsize;

    struct FlakyRenderer {
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl HtmlRenderer for FlakyRenderer {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn render(&self, _job: &RenderJob) -> Result<Artifact> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Timeout(10));
            }
            Ok(Artifact {
                bytes: b"png".to_vec(),
                format: crate::job::OutputFormat::Png,
                width: 1,
                height: 1,
            })
        }
    }

    fn queue(dir: &std::path::Path, fail_first: usize, max_attempts: u32) -> JobQueue {
        let config = RenderConfig {
            queue_max_attempts: max_attempts,
            queue_backoff_ms: 0,
            ..Default::default()
        };
        JobQueue::open(
            Storage::new(dir),
            &config,
            Arc::new(FlakyRenderer {
                fail_first,
                calls: AtomicUsize::new(0),
            }),
        )
    }

    #[test]
    fn key_depends_on_input_data() {
        let a = RenderJob::new("<p>a</p>", "a.png");
        let b = RenderJob::new("<p>b</p>", "a.png");
        assert_eq!(unit_key(&a), unit_key(&a.clone()));
        assert_ne!(unit_key(&a), unit_key(&b));
        assert_eq!(unit_key(&a).len(), 64);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(100, 1), 100);
        assert_eq!(backoff_delay(100, 2), 200);
        assert_eq!(backoff_delay(100, 4), 800);
    }

    #[test]
    fn timeouts_are_retried_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path(), 1, 3);
        q.enqueue(RenderJob::new("<p>a</p>", "a.png")).unwrap();
        assert_eq!(q.run_pending(), 1);
        let pending = q.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(q.run_pending(), 1);
        assert!(q.pending().is_empty());
        assert!(dir.path().join("renders/a.png").is_file());
    }

    #[test]
    fn exhausted_units_emit_failed() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path(), usize::MAX, 2);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        q.on_event(Arc::new(move |e: &QueueEvent| sink.lock().unwrap().push(e.clone())));
        q.enqueue(RenderJob::new("<p>a</p>", "a.png")).unwrap();
        q.run_pending();
        q.run_pending();
        assert!(q.pending().is_empty());
        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(QueueEvent::Failed { .. })));
    }

    struct PanickingRenderer;

    impl HtmlRenderer for PanickingRenderer {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn render(&self, _job: &RenderJob) -> Result<Artifact> {
            panic!("canvas overflow");
        }
    }

    #[test]
    fn panicking_renderer_leaves_unit_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let config = RenderConfig {
            queue_max_attempts: 3,
            queue_backoff_ms: 0,
            ..Default::default()
        };
        let q = JobQueue::open(Storage::new(dir.path()), &config, Arc::new(PanickingRenderer));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        q.on_event(Arc::new(move |e: &QueueEvent| sink.lock().unwrap().push(e.clone())));
        q.enqueue(RenderJob::new("<p>a</p>", "a.png")).unwrap();
        assert_eq!(q.run_pending(), 1);
        let pending = q.pending();
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("canvas overflow"));
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(QueueEvent::Retrying { attempts: 1, .. })
        ));
        // the run lock is not poisoned
        assert_eq!(q.run_pending(), 1);
        assert_eq!(q.pending()[0].attempts, 2);
    }

    #[test]
    fn duplicate_enqueue_keeps_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path(), 0, 3);
        let job = RenderJob::new("<p>a</p>", "a.png");
        let k1 = q.enqueue(job.clone()).unwrap();
        let k2 = q.enqueue(job).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(q.pending().len(), 1);
    }
}
