//! Rendered image cache
//!
//! Finished worker renders are remembered per catalogue and product under
//! `rendered::{label}::{id}`. Lookups fall back to the exported file
//! `{label}/product_{id}_{label}.png` when the cache has no entry.

use crate::platform::PreferenceStore;
use crate::storage::Storage;
use base64::Engine as _;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const CACHE_STORE: &str = "rendered_images";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRender {
    pub base64: String,
    /// Milliseconds since the epoch when the render was stored
    pub timestamp: i64,
    pub filename: String,
}

pub fn cache_key(label: &str, id: &str) -> String {
    format!("rendered::{}::{}", label, id)
}

pub fn export_file_name(label: &str, id: &str) -> String {
    format!("product_{}_{}.png", id, label)
}

pub struct RenderCache {
    storage: Storage,
    store: PreferenceStore,
}

impl RenderCache {
    pub fn new(storage: Storage) -> Self {
        Self {
            store: PreferenceStore::new(storage.clone(), CACHE_STORE),
            storage,
        }
    }

    pub fn put(&self, label: &str, id: &str, base64: &str) -> bool {
        let entry = CachedRender {
            base64: base64.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            filename: export_file_name(label, id),
        };
        match serde_json::to_string(&entry) {
            Ok(json) => self.store.set_string(&cache_key(label, id), &json),
            Err(e) => {
                warn!("Could not serialise cache entry: {}", e);
                false
            }
        }
    }

    pub fn get(&self, label: &str, id: &str) -> Option<CachedRender> {
        let key = cache_key(label, id);
        let raw = self.store.get_string(&key)?;
        match serde_json::from_str::<CachedRender>(&raw) {
            Ok(entry) if !entry.base64.is_empty() => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not parse stored image data for {}: {}", key, e);
                None
            }
        }
    }

    /// PNG data URI from the cache, else from the exported file
    pub fn get_data_uri(&self, label: &str, id: &str) -> Option<String> {
        if let Some(entry) = self.get(label, id) {
            debug!("Retrieved rendered image from cache: {}", cache_key(label, id));
            return Some(format!("data:image/png;base64,{}", entry.base64));
        }
        let file = export_file_name(label, id);
        if !self.storage.exists(label, &file) {
            debug!("Rendered image not found in storage: {}/{}", label, file);
            return None;
        }
        let bytes = self.storage.read(label, &file)?;
        debug!("Retrieved rendered image from storage: {}/{}", label, file);
        Some(format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ))
    }

    pub fn remove(&self, label: &str, id: &str) -> bool {
        self.store.remove(&cache_key(label, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RenderCache::new(Storage::new(dir.path()));
        assert!(cache.put("Master", "42", "AAAA"));
        let entry = cache.get("Master", "42").unwrap();
        assert_eq!(entry.filename, "product_42_Master.png");
        assert_eq!(cache.get_data_uri("Master", "42").as_deref(), Some("data:image/png;base64,AAAA"));
        assert!(cache.remove("Master", "42"));
        assert!(cache.get("Master", "42").is_none());
    }

    #[test]
    fn falls_back_to_exported_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write("Resell", "product_7_Resell.png", &[1, 2, 3]);
        let cache = RenderCache::new(storage);
        assert_eq!(cache.get_data_uri("Resell", "7").as_deref(), Some("data:image/png;base64,AQID"));
        assert!(cache.get_data_uri("Resell", "8").is_none());
    }
}
