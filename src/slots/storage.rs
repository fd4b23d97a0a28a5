use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

/// Client-local key-value storage holding serialized collections.
pub trait KeyValueStorage {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// In-process storage for exercising the store without touching disk.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, String>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: &str, value: &str) -> Self {
        let mut storage = Self::new();
        storage.entries.insert(key.to_string(), value.to_string());
        storage
    }
}

#[cfg(test)]
impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// A JSON object file mapping keys to string values. Every write rewrites
/// the whole file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("unable to read store file {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(
                    "invalid store file {} at line {}, column {}: {err}; resetting it",
                    self.path.display(),
                    err.line(),
                    err.column()
                );
                let entries = BTreeMap::new();
                self.write_all(&entries)?;
                Ok(entries)
            }
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("unable to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, format!("{text}\n"))
            .with_context(|| format!("unable to write store file {}", self.path.display()))?;
        debug!("wrote {} key(s) to {}", entries.len(), self.path.display());
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn file_storage_round_trips_values() {
        let dir = tempdir().expect("tempdir");
        let mut storage = FileStorage::new(dir.path().join("store.json"));

        assert_eq!(storage.get("events").expect("read"), None);
        storage.set("events", "[]").expect("write");
        storage.set("other", "x").expect("write");
        assert_eq!(storage.get("events").expect("read").as_deref(), Some("[]"));

        storage.remove("events").expect("remove");
        assert_eq!(storage.get("events").expect("read"), None);
        assert_eq!(storage.get("other").expect("read").as_deref(), Some("x"));
    }

    #[test]
    fn file_storage_creates_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");
        let mut storage = FileStorage::new(&path);

        storage.set("events", "[]").expect("write");
        assert!(path.exists());
    }

    #[test]
    fn file_storage_resets_malformed_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");

        for corrupt in [r#""not-an-array""#, "[{ broken", r#"{ "events": 42 }"#] {
            fs::write(&path, corrupt).expect("write");

            let mut storage = FileStorage::new(&path);
            assert_eq!(storage.get("events").expect("recovered read"), None);
            assert_eq!(fs::read_to_string(&path).expect("read back").trim(), "{}");

            storage.set("events", "[]").expect("write after reset");
            assert_eq!(storage.get("events").expect("read").as_deref(), Some("[]"));
        }
    }

    #[test]
    fn memory_storage_removes_keys() {
        let mut storage = MemoryStorage::with_entry("events", "[]");
        storage.remove("events").expect("remove");
        assert_eq!(storage.get("events").expect("read"), None);
    }
}
