//! Persisted device → service-UUID cache
//!
//! The cache is a plain key → list-of-strings store. It is read once at
//! startup and written after every successful discovery.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{BleError, Result};

pub const DEFAULT_CACHE_NAMESPACE: &str = "com.unible.services";

pub trait ServiceCache: Send + Sync {
    /// Every cached entry, keyed by device identifier
    fn load_all(&self) -> Result<HashMap<String, Vec<String>>>;

    /// Replace the entry for `device_id`
    ///
    /// May block on file I/O; async callers run it on a blocking thread.
    fn store(&self, device_id: &str, services: &[String]) -> Result<()>;
}

// ----------------------------------------------------------------------------
// In-Memory Cache
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryServiceCache {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, device_id: impl Into<String>, services: Vec<String>) -> Self {
        self.entries.lock().insert(device_id.into(), services);
        self
    }
}

impl ServiceCache for MemoryServiceCache {
    fn load_all(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(self.entries.lock().clone())
    }

    fn store(&self, device_id: &str, services: &[String]) -> Result<()> {
        self.entries
            .lock()
            .insert(device_id.to_string(), services.to_vec());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// JSON File Cache
// ----------------------------------------------------------------------------

/// Cache stored as one JSON object in `<dir>/<namespace>.json`
#[derive(Debug)]
pub struct JsonFileServiceCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl JsonFileServiceCache {
    pub fn open(dir: impl AsRef<Path>, namespace: &str) -> Self {
        let path = dir.as_ref().join(format!("{namespace}.json"));
        let entries = read_entries(&path);
        debug!(
            "Opened service cache {} ({} devices)",
            path.display(),
            entries.len()
        );
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, Vec<String>>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| cache_error(&self.path, e))?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| BleError::Unknown(format!("Failed to encode service cache: {e}")))?;
        fs::write(&self.path, json).map_err(|e| cache_error(&self.path, e))
    }
}

impl ServiceCache for JsonFileServiceCache {
    fn load_all(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(self.entries.lock().clone())
    }

    fn store(&self, device_id: &str, services: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(device_id.to_string(), services.to_vec());
        self.persist(&entries)
    }
}

fn read_entries(path: &Path) -> HashMap<String, Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Unable to read service cache {}: {}", path.display(), e);
            return HashMap::new();
        }
    };

    serde_json::from_str(&contents).unwrap_or_else(|e| {
        warn!("Discarding corrupt service cache {}: {}", path.display(), e);
        HashMap::new()
    })
}

fn cache_error(path: &Path, err: std::io::Error) -> BleError {
    BleError::Unknown(format!("Service cache {}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec!["0000180d-0000-1000-8000-00805f9b34fb".to_string()];

        let cache = JsonFileServiceCache::open(dir.path(), DEFAULT_CACHE_NAMESPACE);
        cache.store("AA:BB", &services).unwrap();
        assert!(cache.path().ends_with("com.unible.services.json"));

        let reopened = JsonFileServiceCache::open(dir.path(), DEFAULT_CACHE_NAMESPACE);
        assert_eq!(reopened.load_all().unwrap().get("AA:BB"), Some(&services));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ns.json"), "{not json").unwrap();

        let cache = JsonFileServiceCache::open(dir.path(), "ns");
        assert!(cache.load_all().unwrap().is_empty());

        cache.store("D", &[]).unwrap();
        assert_eq!(cache.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_cache_replaces_entries() {
        let cache = MemoryServiceCache::new().with_entry("D", vec!["a".into()]);
        cache.store("D", &["b".to_string()]).unwrap();
        assert_eq!(cache.load_all().unwrap()["D"], vec!["b".to_string()]);
    }
}
