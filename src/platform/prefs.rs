//! Named key/value preference stores persisted through [`Storage`]
//!
//! A store is one JSON object file (`prefs/{name}.json`). Reads of a missing
//! or corrupt file behave as an empty store; writes replace the whole file
//! atomically through the storage accessor.

use crate::job::RenderJob;
use crate::storage::Storage;
use log::{debug, error, warn};
use serde_json::{Map, Value};
use std::sync::Mutex;

const PREFS_FOLDER: &str = "prefs";

/// Store name and key holding jobs left over when the app was closed
pub const RENDER_PREFS: &str = "catshare_render";
pub const PENDING_JOBS_KEY: &str = "pending_jobs";

pub struct PreferenceStore {
    storage: Storage,
    file: String,
    // serialises read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl PreferenceStore {
    pub fn new(storage: Storage, name: &str) -> Self {
        Self {
            storage,
            file: format!("{}.json", name),
            lock: Mutex::new(()),
        }
    }

    fn load_map(&self) -> Map<String, Value> {
        let Some(bytes) = self.storage.read(PREFS_FOLDER, &self.file) else {
            return Map::new();
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("Ignoring unreadable preference file {}", self.file);
                Map::new()
            }
        }
    }

    fn save_map(&self, map: &Map<String, Value>) -> bool {
        match serde_json::to_vec(map) {
            Ok(bytes) => self.storage.write(PREFS_FOLDER, &self.file, &bytes),
            Err(e) => {
                error!("Failed to serialise preferences {}: {}", self.file, e);
                false
            }
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let _g = self.lock.lock().ok()?;
        self.load_map()
            .get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn set_string(&self, key: &str, value: &str) -> bool {
        let Ok(_g) = self.lock.lock() else {
            return false;
        };
        let mut map = self.load_map();
        map.insert(key.to_string(), Value::String(value.to_string()));
        self.save_map(&map)
    }

    pub fn remove(&self, key: &str) -> bool {
        let Ok(_g) = self.lock.lock() else {
            return false;
        };
        let mut map = self.load_map();
        if map.remove(key).is_none() {
            return true;
        }
        self.save_map(&map)
    }

    /// Read a key and delete it in one locked step
    pub fn take_string(&self, key: &str) -> Option<String> {
        let _g = self.lock.lock().ok()?;
        let mut map = self.load_map();
        let value = map.remove(key)?;
        if !self.save_map(&map) {
            error!("Failed to clear {} after reading it", key);
        }
        value.as_str().map(|s| s.to_string())
    }
}

/// The persisted set of jobs the resume path picks up on next start
pub struct PendingJobs {
    store: PreferenceStore,
}

impl PendingJobs {
    pub fn new(storage: Storage) -> Self {
        Self {
            store: PreferenceStore::new(storage, RENDER_PREFS),
        }
    }

    /// Replace the pending set; an empty list removes it
    pub fn save(&self, jobs: &[RenderJob]) -> bool {
        if jobs.is_empty() {
            return self.store.remove(PENDING_JOBS_KEY);
        }
        match serde_json::to_string(jobs) {
            Ok(json) => {
                debug!("Saved {} pending render jobs", jobs.len());
                self.store.set_string(PENDING_JOBS_KEY, &json)
            }
            Err(e) => {
                error!("Failed to save pending jobs: {}", e);
                false
            }
        }
    }

    /// Peek at the pending set without clearing it
    pub fn load(&self) -> Vec<RenderJob> {
        self.store
            .get_string(PENDING_JOBS_KEY)
            .map(|json| parse_jobs(&json))
            .unwrap_or_default()
    }

    /// Read the pending set and clear it before returning
    pub fn take(&self) -> Vec<RenderJob> {
        self.store
            .take_string(PENDING_JOBS_KEY)
            .map(|json| parse_jobs(&json))
            .unwrap_or_default()
    }

    pub fn clear(&self) -> bool {
        self.store.remove(PENDING_JOBS_KEY)
    }
}

fn parse_jobs(json: &str) -> Vec<RenderJob> {
    if json.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<RenderJob>>(json) {
        Ok(jobs) => jobs.into_iter().filter(RenderJob::is_valid).collect(),
        Err(e) => {
            error!("Error parsing render jobs JSON: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(Storage::new(dir.path()), "test");
        assert!(store.get_string("k").is_none());
        assert!(store.set_string("k", "v"));
        assert_eq!(store.get_string("k").as_deref(), Some("v"));
        assert!(store.remove("k"));
        assert!(store.get_string("k").is_none());
    }

    #[test]
    fn take_clears_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let pending = PendingJobs::new(Storage::new(dir.path()));
        let jobs = vec![
            RenderJob::new("<p>a</p>", "a.png"),
            RenderJob::new("", "dropped.png"),
        ];
        assert!(pending.save(&jobs));
        assert_eq!(pending.load().len(), 1);
        assert_eq!(pending.take().len(), 1);
        assert!(pending.take().is_empty());
    }

    #[test]
    fn saving_empty_list_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let pending = PendingJobs::new(Storage::new(dir.path()));
        pending.save(&[RenderJob::new("<p>a</p>", "a.png")]);
        pending.save(&[]);
        assert!(pending.load().is_empty());
    }
}
