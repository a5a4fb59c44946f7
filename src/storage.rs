//! Storage accessor
//!
//! The only component that touches the filesystem. Every operation resolves
//! `{root}/{folder}/{file}`, and every I/O failure is logged and converted
//! into a `false`/`None` result instead of being propagated.

use base64::Engine as _;
use log::{debug, error, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const TMP_SUFFIX: &str = ".partial";

/// Byte-level access to named folders under a stable root
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a folder under the root, creating it if absent
    pub fn resolve_folder(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_name(name) {
            warn!("Rejected folder name: {:?}", name);
            return None;
        }
        let folder = self.root.join(name);
        if let Err(e) = fs::create_dir_all(&folder) {
            error!("Failed to create folder {}: {}", folder.display(), e);
            return None;
        }
        Some(folder)
    }

    /// Path an artifact would live at, without touching the disk
    pub fn artifact_path(&self, folder: &str, file: &str) -> PathBuf {
        self.root.join(folder).join(file)
    }

    fn file_path(&self, folder: &str, file: &str) -> Option<PathBuf> {
        if !is_plain_name(file) {
            warn!("Rejected file name: {:?}", file);
            return None;
        }
        self.resolve_folder(folder).map(|dir| dir.join(file))
    }

    /// Write (overwriting) `bytes` to `{folder}/{file}`
    ///
    /// The bytes land in a temporary sibling first and are renamed into
    /// place, so readers never observe a partially written artifact.
    pub fn write(&self, folder: &str, file: &str, bytes: &[u8]) -> bool {
        let Some(path) = self.file_path(folder, file) else {
            return false;
        };
        let tmp = path.with_file_name(format!("{}{}", file, TMP_SUFFIX));
        let res = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(bytes)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &path));
        match res {
            Ok(()) => {
                debug!("Saved file to: {}", path.display());
                true
            }
            Err(e) => {
                error!("Error saving file {}: {}", path.display(), e);
                let _ = fs::remove_file(&tmp);
                false
            }
        }
    }

    /// Decode base64 (bare or as a data URI) and write it to `{folder}/{file}`
    pub fn save_base64(&self, folder: &str, file: &str, data: &str) -> bool {
        let payload = match data.trim() {
            d if d.starts_with("data:") => d.split_once(',').map(|(_, p)| p).unwrap_or(""),
            d => d,
        };
        match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(bytes) => self.write(folder, file, &bytes),
            Err(e) => {
                error!("Error decoding base64 for {}/{}: {}", folder, file, e);
                false
            }
        }
    }

    pub fn read(&self, folder: &str, file: &str) -> Option<Vec<u8>> {
        let path = self.file_path(folder, file)?;
        if !path.exists() {
            warn!("File not found: {}", path.display());
            return None;
        }
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Error reading file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn exists(&self, folder: &str, file: &str) -> bool {
        is_plain_name(folder) && is_plain_name(file) && self.artifact_path(folder, file).is_file()
    }

    pub fn delete(&self, folder: &str, file: &str) -> bool {
        let Some(path) = self.file_path(folder, file) else {
            return false;
        };
        if !path.exists() {
            warn!("File not found: {}", path.display());
            return false;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted file: {}", path.display());
                true
            }
            Err(e) => {
                warn!("Failed to delete file {}: {}", path.display(), e);
                false
            }
        }
    }

    /// File names in a folder, sorted; in-progress writes are hidden
    pub fn list(&self, folder: &str) -> Vec<String> {
        let Some(dir) = self.resolve_folder(folder) else {
            return Vec::new();
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Error listing files in {}: {}", dir.display(), e);
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.ends_with(TMP_SUFFIX))
            .collect();
        names.sort();
        names
    }

    /// Total size in bytes of all files below a folder
    pub fn size(&self, folder: &str) -> u64 {
        fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    total += walk(&entry.path())?;
                } else {
                    total += meta.len();
                }
            }
            Ok(total)
        }

        let Some(dir) = self.resolve_folder(folder) else {
            return 0;
        };
        walk(&dir).unwrap_or_else(|e| {
            error!("Error calculating folder size for {}: {}", dir.display(), e);
            0
        })
    }

    /// Delete everything in a folder, then recreate it empty
    pub fn clear(&self, folder: &str) -> bool {
        let Some(dir) = self.resolve_folder(folder) else {
            return false;
        };
        match fs::remove_dir_all(&dir).and_then(|_| fs::create_dir_all(&dir)) {
            Ok(()) => {
                debug!("Cleared folder: {}", folder);
                true
            }
            Err(e) => {
                error!("Error clearing folder {}: {}", folder, e);
                false
            }
        }
    }
}
