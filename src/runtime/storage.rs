//! Filesystem layout helpers and atomic write operations
//!
//! Manages the runtime root directory (config persistence and the object
//! spill area) and ensures atomic writes via temp files and renames.

use std::fs;
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use super::error::{StorageError, StorageResult};
use super::ident::ObjectId;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the spill directory path
    pub fn spill_dir(&self) -> PathBuf {
        self.root.join("spill")
    }

    /// Get the spill file path for an object
    pub fn spill_path(&self, id: &ObjectId) -> PathBuf {
        self.spill_dir().join(id.as_str())
    }

    /// Write a spilled object payload atomically
    pub fn write_spill(&self, id: &ObjectId, payload: &[u8]) -> StorageResult<()> {
        atomic_write(&self.spill_path(id), payload)
    }

    /// Read a spilled object payload back
    pub fn read_spill(&self, id: &ObjectId) -> StorageResult<Vec<u8>> {
        let path = self.spill_path(id);
        if !path.exists() {
            return Err(StorageError::PathNotFound(path));
        }
        Ok(fs::read(path)?)
    }

    /// Delete a spilled object payload, ignoring files that never existed
    pub fn remove_spill(&self, id: &ObjectId) -> StorageResult<()> {
        let path = self.spill_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Initialize the runtime root directory structure
pub fn init_storage(root: &Path) -> StorageResult<()> {
    fs::create_dir_all(root)?;
    fs::create_dir_all(root.join("spill"))?;
    Ok(())
}

/// Persist the runtime configuration to `<root>/config.json`
pub fn write_config(config: &RuntimeConfig) -> StorageResult<()> {
    let storage = Storage::new(config.root.clone());
    let data = serde_json::to_vec_pretty(config)?;
    atomic_write(&storage.config_path(), &data)
}

/// Load a runtime configuration from `<root>/config.json`
pub fn load_config(root: &Path) -> StorageResult<RuntimeConfig> {
    let path = root.join("config.json");
    if !path.exists() {
        return Err(StorageError::ConfigError(format!(
            "no config.json under {}",
            root.display()
        )));
    }
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write `data` to `path` atomically via a temp file and rename
pub fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::PathNotFound(path.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(|err| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    fs::rename(&tmp, path).map_err(|err| StorageError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_spill_round_trip() {
        let temp = TempDir::new().unwrap();
        init_storage(temp.path()).unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let id = ObjectId::fresh();
        storage.write_spill(&id, b"payload bytes").unwrap();
        assert_eq!(storage.read_spill(&id).unwrap(), b"payload bytes");

        storage.remove_spill(&id).unwrap();
        assert!(storage.read_spill(&id).is_err());
    }

    #[test]
    fn test_remove_spill_is_idempotent() {
        let temp = TempDir::new().unwrap();
        init_storage(temp.path()).unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let id = ObjectId::fresh();
        storage.remove_spill(&id).unwrap();
    }

    #[test]
    fn test_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = RuntimeConfig {
            root: temp.path().to_path_buf(),
            ..RuntimeConfig::default()
        };

        init_storage(&config.root).unwrap();
        write_config(&config).unwrap();

        let loaded = load_config(temp.path()).unwrap();
        assert_eq!(loaded.store_capacity_bytes, config.store_capacity_bytes);
        assert_eq!(loaded.worker_slots, config.worker_slots);
    }
}
