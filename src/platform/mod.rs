//! Host collaborators: preference storage and progress notifications
//!
//! These are the pieces of the device the pipeline leans on but does not
//! own. Each surface is a small trait or type with a default implementation
//! that is safe to use in tests and on hosts without the real facility.

pub mod notification;
pub mod prefs;

pub use notification::{LogNotifier, Notification, Notifier, NotifierCall, RecordingNotifier};
pub use prefs::{PendingJobs, PreferenceStore};

use crate::storage::Storage;
use std::sync::Arc;

/// Bundle of host surfaces handed to the services
#[derive(Clone)]
pub struct Platform {
    pub storage: Storage,
    pub notifier: Arc<dyn Notifier>,
}

impl Platform {
    pub fn new(storage: Storage, notifier: Arc<dyn Notifier>) -> Self {
        Self { storage, notifier }
    }

    /// A platform whose notifications only go to the log
    pub fn headless(storage: Storage) -> Self {
        Self::new(storage, Arc::new(LogNotifier::new()))
    }

    pub fn pending_jobs(&self) -> PendingJobs {
        PendingJobs::new(self.storage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_platform_provides_pending_jobs_store() {
        let dir = tempfile::tempdir().unwrap();
        let p = Platform::headless(Storage::new(dir.path()));
        assert!(p.pending_jobs().load().is_empty());
        p.notifier.update(&Notification::new("t", "c", 1, 2));
    }
}
