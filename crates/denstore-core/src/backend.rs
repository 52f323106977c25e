//! Backing store adapters
//!
//! The engine talks to its persistent surface through the `Backend`
//! trait. `FileBackend` is the durable store: one UTF-8 file per key
//! under a directory, written via temp file + atomic rename, with an
//! optional byte quota that rejects oversized writes the way a
//! browser-class local store would. `MemoryBackend` is the
//! process-lifetime mirror the engine falls back to when the durable
//! store is unavailable.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::error::{DenError, DenResult};

/// Suffix of in-flight temp files; never reported by `keys()`.
const TMP_SUFFIX: &str = ".tmp";

/// A string key-value surface the engine persists through.
///
/// Keys form a small, fixed, filename-safe namespace
/// (`<prefix>.pet`, `<prefix>.feedingHistory`, `<prefix>.expressions`).
pub trait Backend: Send {
    fn read(&self, key: &str) -> DenResult<Option<String>>;
    fn write(&mut self, key: &str, value: &str) -> DenResult<()>;
    fn remove(&mut self, key: &str) -> DenResult<()>;
    fn keys(&self) -> DenResult<Vec<String>>;
}

/// Durable file-per-key backend with an optional byte quota.
pub struct FileBackend {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileBackend {
    /// Open or create a backend directory with no quota.
    pub fn open<P: AsRef<Path>>(dir: P) -> DenResult<Self> {
        Self::create(dir, None)
    }

    /// Open or create a backend directory that rejects writes once the
    /// total stored bytes would exceed `quota_bytes`.
    pub fn with_quota<P: AsRef<Path>>(dir: P, quota_bytes: u64) -> DenResult<Self> {
        Self::create(dir, Some(quota_bytes))
    }

    fn create<P: AsRef<Path>>(dir: P, quota_bytes: Option<u64>) -> DenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| DenError::Io {
            path: Some(dir.clone()),
            kind: e.kind(),
            message: format!("Failed to create backend directory: {}", e),
        })?;
        Ok(Self { dir, quota_bytes })
    }

    /// Directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Bytes currently stored, excluding `key`'s own file and temp files.
    fn used_bytes_excluding(&self, key: &str) -> DenResult<u64> {
        let mut total = 0u64;
        let entries = fs::read_dir(&self.dir).map_err(|e| DenError::Io {
            path: Some(self.dir.clone()),
            kind: e.kind(),
            message: format!("Failed to read backend directory: {}", e),
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if name == key || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

impl Backend for FileBackend {
    fn read(&self, key: &str) -> DenResult<Option<String>> {
        let path = self.file_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DenError::Io {
                path: Some(path),
                kind: e.kind(),
                message: format!("Failed to read key file: {}", e),
            }),
        }
    }

    fn write(&mut self, key: &str, value: &str) -> DenResult<()> {
        if let Some(quota) = self.quota_bytes {
            let incoming = value.len() as u64;
            let used = self.used_bytes_excluding(key)?;
            if used + incoming > quota {
                return Err(DenError::QuotaExceeded {
                    key: key.to_string(),
                    attempted_bytes: incoming,
                    quota_bytes: quota,
                });
            }
        }

        // Write to a temp file, sync, then atomically rename over the
        // key file so readers never observe a partial value.
        let path = self.file_for(key);
        let tmp_path = self.dir.join(format!("{}{}", key, TMP_SUFFIX));

        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| DenError::Io {
                    path: Some(tmp_path.clone()),
                    kind: e.kind(),
                    message: format!("Failed to create temp file: {}", e),
                })?;

            tmp.write_all(value.as_bytes()).map_err(|e| DenError::Io {
                path: Some(tmp_path.clone()),
                kind: e.kind(),
                message: format!("Failed to write temp file: {}", e),
            })?;

            tmp.sync_all().map_err(|e| DenError::Io {
                path: Some(tmp_path.clone()),
                kind: e.kind(),
                message: format!("Failed to sync temp file: {}", e),
            })?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| DenError::Io {
            path: Some(path),
            kind: e.kind(),
            message: format!("Failed to rename temp file over key file: {}", e),
        })
    }

    fn remove(&mut self, key: &str) -> DenResult<()> {
        let path = self.file_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DenError::Io {
                path: Some(path),
                kind: e.kind(),
                message: format!("Failed to remove key file: {}", e),
            }),
        }
    }

    fn keys(&self) -> DenResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| DenError::Io {
            path: Some(self.dir.clone()),
            kind: e.kind(),
            message: format!("Failed to read backend directory: {}", e),
        })?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TMP_SUFFIX) {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }
}

/// Process-lifetime in-memory mirror.
#[derive(Default)]
pub struct MemoryBackend {
    map: HashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Backend for MemoryBackend {
    fn read(&self, key: &str) -> DenResult<Option<String>> {
        Ok(self.map.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &str) -> DenResult<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> DenResult<()> {
        self.map.remove(key);
        Ok(())
    }

    fn keys(&self) -> DenResult<Vec<String>> {
        Ok(self.map.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileBackend::open(dir.path()).unwrap();

        assert_eq!(backend.read("denstore.pet").unwrap(), None);
        backend.write("denstore.pet", "{\"id\":\"p\"}").unwrap();
        assert_eq!(backend.read("denstore.pet").unwrap(), Some("{\"id\":\"p\"}".to_string()));

        backend.remove("denstore.pet").unwrap();
        assert_eq!(backend.read("denstore.pet").unwrap(), None);
        // Removing a missing key is a no-op
        backend.remove("denstore.pet").unwrap();
    }

    #[test]
    fn test_file_backend_keys_skip_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileBackend::open(dir.path()).unwrap();

        backend.write("denstore.pet", "a").unwrap();
        backend.write("denstore.expressions", "b").unwrap();
        std::fs::write(dir.path().join("denstore.pet.tmp"), "partial").unwrap();

        let mut keys = backend.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["denstore.expressions", "denstore.pet"]);
    }

    #[test]
    fn test_file_backend_quota_rejects_oversized_write() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileBackend::with_quota(dir.path(), 16).unwrap();

        backend.write("denstore.pet", "tiny").unwrap();
        let err = backend.write("denstore.feedingHistory", &"x".repeat(64)).unwrap_err();
        assert!(err.is_quota());

        // The rejected key was never created
        assert_eq!(backend.read("denstore.feedingHistory").unwrap(), None);
    }

    #[test]
    fn test_file_backend_quota_allows_overwrite_in_place() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileBackend::with_quota(dir.path(), 10).unwrap();

        backend.write("denstore.pet", &"a".repeat(8)).unwrap();
        // Overwriting the same key does not double-count its old bytes
        backend.write("denstore.pet", &"b".repeat(9)).unwrap();
        assert_eq!(backend.read("denstore.pet").unwrap(), Some("b".repeat(9)));
    }

    #[test]
    fn test_file_backend_overwrite_is_atomic_replace() {
        let dir = TempDir::new().unwrap();
        let mut backend = FileBackend::open(dir.path()).unwrap();

        backend.write("denstore.pet", "old").unwrap();
        backend.write("denstore.pet", "new").unwrap();
        assert_eq!(backend.read("denstore.pet").unwrap(), Some("new".to_string()));

        // No temp file left behind
        let leftover: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str().map_or(false, |n| n.ends_with(".tmp")))
            .collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_memory_backend_roundtrip() {
        let mut backend = MemoryBackend::new();
        assert!(backend.is_empty());

        backend.write("k", "v").unwrap();
        assert_eq!(backend.read("k").unwrap(), Some("v".to_string()));
        assert_eq!(backend.len(), 1);

        backend.remove("k").unwrap();
        assert_eq!(backend.read("k").unwrap(), None);
    }
}
