//! Session checkpoint persistence: a black-box `put`/`get`/`list`/`delete`
//! key-value interface, backed by one JSON file per key under a
//! configurable directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

pub trait CheckpointStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), EngineError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, EngineError>;
    fn delete(&self, key: &str) -> Result<(), EngineError>;
}

/// Stores each key as `<root>/<sanitized-key>.json`. Keys are sanitized by
/// replacing path separators so a malicious or malformed session id can't
/// escape `root`.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(EngineError::Io)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
            .collect();
        self.root.join(format!("{sanitized}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        fs::write(self.path_for(key), value).map_err(|e| EngineError::Checkpoint(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Checkpoint(e.to_string())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| EngineError::Checkpoint(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::Checkpoint(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else { continue };
            if stem.starts_with(prefix) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), EngineError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Checkpoint(e.to_string())),
        }
    }
}

pub fn default_checkpoint_dir(base: &Path) -> PathBuf {
    base.join("sessions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!("fuzzcore-ckpt-test-{}", std::process::id()));
        let store = FileCheckpointStore::new(&dir).unwrap();
        store.put("session-1", b"hello").unwrap();
        assert_eq!(store.get("session-1").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
        let keys = store.list("session").unwrap();
        assert_eq!(keys, vec!["session-1".to_string()]);
        store.delete("session-1").unwrap();
        assert_eq!(store.get("session-1").unwrap(), None);
        let _ = fs::remove_dir_all(&dir);
    }
}
