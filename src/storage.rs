//! Slot Storage
//!
//! Named string slots backing the cipher vault and credential store.
//! Each slot is read and replaced as a whole value; there are no partial updates.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid slot name: {0}")]
    InvalidSlot(String),
}

/// A key/value store of whole-value slots
#[async_trait]
pub trait SlotStorage: Send + Sync {
    /// Read a slot, `None` when it has never been written or was removed
    async fn get(&self, slot: &str) -> Result<Option<String>, StorageError>;

    /// Replace a slot's value wholesale
    async fn set(&self, slot: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a slot. Removing a missing slot is not an error.
    async fn remove(&self, slot: &str) -> Result<(), StorageError>;

    /// Check whether a slot holds a value
    async fn contains(&self, slot: &str) -> Result<bool, StorageError> {
        Ok(self.get(slot).await?.is_some())
    }
}

fn validate_slot(slot: &str) -> Result<(), StorageError> {
    let valid = !slot.is_empty()
        && !slot.starts_with('.')
        && slot
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidSlot(slot.to_string()))
    }
}

/// Directory-backed slots, one file per slot
#[derive(Debug, Clone)]
pub struct FileSlotStorage {
    dir: PathBuf,
}

impl FileSlotStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> Result<PathBuf, StorageError> {
        validate_slot(slot)?;
        Ok(self.dir.join(slot))
    }
}

#[async_trait]
impl SlotStorage for FileSlotStorage {
    async fn get(&self, slot: &str) -> Result<Option<String>, StorageError> {
        let path = self.slot_path(slot)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, slot: &str, value: &str) -> Result<(), StorageError> {
        let path = self.slot_path(slot)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write atomically via temp file
        let temp_path = self.dir.join(format!(".{}.{}.tmp", slot, Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, value).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(slot, "Slot written");
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<(), StorageError> {
        let path = self.slot_path(slot)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, slot: &str) -> Result<bool, StorageError> {
        let path = self.slot_path(slot)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// In-process slots, lost on drop
#[derive(Debug, Default)]
pub struct MemorySlotStorage {
    slots: RwLock<HashMap<String, String>>,
}

impl MemorySlotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStorage for MemorySlotStorage {
    async fn get(&self, slot: &str) -> Result<Option<String>, StorageError> {
        validate_slot(slot)?;
        Ok(self.slots.read().get(slot).cloned())
    }

    async fn set(&self, slot: &str, value: &str) -> Result<(), StorageError> {
        validate_slot(slot)?;
        self.slots.write().insert(slot.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<(), StorageError> {
        validate_slot(slot)?;
        self.slots.write().remove(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_slots_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileSlotStorage::new(dir.path().join("slots"));

        assert_eq!(storage.get("alpha").await.unwrap(), None);
        assert!(!storage.contains("alpha").await.unwrap());

        storage.set("alpha", "one").await.unwrap();
        storage.set("alpha", "two").await.unwrap();
        assert_eq!(storage.get("alpha").await.unwrap().as_deref(), Some("two"));
        assert!(storage.contains("alpha").await.unwrap());

        storage.remove("alpha").await.unwrap();
        storage.remove("alpha").await.unwrap();
        assert_eq!(storage.get("alpha").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_slots_leave_no_temp_files() {
        let dir = tempdir().unwrap();
        let storage = FileSlotStorage::new(dir.path());

        storage.set("beta", "value").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn test_slot_names_cannot_escape_directory() {
        let storage = FileSlotStorage::new("/tmp/unused");
        for bad in ["", "../etc/passwd", "a/b", ".hidden"] {
            assert!(matches!(
                storage.get(bad).await,
                Err(StorageError::InvalidSlot(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_slots() {
        let storage = MemorySlotStorage::new();
        storage.set("gamma", "v").await.unwrap();
        assert!(storage.contains("gamma").await.unwrap());
        storage.remove("gamma").await.unwrap();
        assert!(!storage.contains("gamma").await.unwrap());
    }
}
