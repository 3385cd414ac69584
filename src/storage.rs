//! Key/value persistence used for session resumption records.
//!
//! Values are opaque byte blobs. Backends report a missing key and a short caller
//! buffer as distinct results so the caller can retry with a bigger buffer.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("storage backend: {0}")]
    Backend(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub trait PersistentStorageDelegate: Send + Sync {
    /// Copies the value into `buffer` and returns its length.
    fn sync_get_key_value(&self, key: &str, buffer: &mut [u8]) -> StorageResult<usize>;
    fn sync_set_key_value(&self, key: &str, value: &[u8]) -> StorageResult<()>;
    fn sync_delete_key_value(&self, key: &str) -> StorageResult<()>;
}

fn copy_out(value: &[u8], buffer: &mut [u8]) -> StorageResult<usize> {
    if buffer.len() < value.len() {
        return Err(StorageError::BufferTooSmall {
            required: value.len(),
        });
    }
    buffer[..value.len()].copy_from_slice(value);
    Ok(value.len())
}

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.values
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_owned()))
    }
}

impl PersistentStorageDelegate for MemoryStorage {
    fn sync_get_key_value(&self, key: &str, buffer: &mut [u8]) -> StorageResult<usize> {
        let values = self.lock()?;
        let value = values.get(key).ok_or(StorageError::NotFound)?;
        copy_out(value, buffer)
    }

    fn sync_set_key_value(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.lock()?.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn sync_delete_key_value(&self, key: &str) -> StorageResult<()> {
        match self.lock()?.remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound),
        }
    }
}

/// Keeps all values in one JSON file, hex encoded. The file is rewritten on every change.
pub struct JsonFileStorage {
    path: String,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStorage {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).context(format!("parsing {}", path))?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path: path.to_owned(),
            values: Mutex::new(values),
        })
    }

    fn save(&self, values: &HashMap<String, String>) -> StorageResult<()> {
        let data = serde_json::to_string_pretty(values)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        std::fs::write(&self.path, data)
            .map_err(|e| StorageError::Backend(format!("writing {}: {}", self.path, e)))
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_owned()))
    }
}

impl PersistentStorageDelegate for JsonFileStorage {
    fn sync_get_key_value(&self, key: &str, buffer: &mut [u8]) -> StorageResult<usize> {
        let values = self.lock()?;
        let encoded = values.get(key).ok_or(StorageError::NotFound)?;
        let value = hex::decode(encoded).map_err(|e| StorageError::Backend(e.to_string()))?;
        copy_out(&value, buffer)
    }

    fn sync_set_key_value(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut values = self.lock()?;
        values.insert(key.to_owned(), hex::encode(value));
        self.save(&values)
    }

    fn sync_delete_key_value(&self, key: &str) -> StorageResult<()> {
        let mut values = self.lock()?;
        if values.remove(key).is_none() {
            return Err(StorageError::NotFound);
        }
        self.save(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("matsess_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("storage.json").to_str().unwrap().to_owned()
    }

    fn exercise(storage: &dyn PersistentStorageDelegate) {
        let mut buf = [0u8; 8];
        assert_eq!(
            storage.sync_get_key_value("k", &mut buf),
            Err(StorageError::NotFound)
        );
        storage.sync_set_key_value("k", b"0123456789").unwrap();
        assert_eq!(
            storage.sync_get_key_value("k", &mut buf),
            Err(StorageError::BufferTooSmall { required: 10 })
        );
        let mut big = [0u8; 16];
        assert_eq!(storage.sync_get_key_value("k", &mut big), Ok(10));
        assert_eq!(&big[..10], b"0123456789");

        storage.sync_delete_key_value("k").unwrap();
        assert_eq!(storage.sync_delete_key_value("k"), Err(StorageError::NotFound));
    }

    #[test]
    fn memory_storage_result_codes() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn json_storage_result_codes_and_reload() {
        let path = test_path("json_storage");
        let storage = JsonFileStorage::load(&path).unwrap();
        exercise(&storage);

        storage.sync_set_key_value("persisted", &[1, 2, 3]).unwrap();
        let reloaded = JsonFileStorage::load(&path).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(reloaded.sync_get_key_value("persisted", &mut buf), Ok(3));
        assert_eq!(buf, [1, 2, 3]);
    }
}
