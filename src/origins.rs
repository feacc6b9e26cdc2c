//! Origin Registry
//!
//! Persisted allow-list of trusted cross-origin callers.
//!
//! The collection is always read whole, mutated, and written back whole.
//! [`JsonFileOriginStore`] serializes mutations within one process; separate
//! processes writing the same file race on a last-write-wins basis.
//!
//! Origins are compared as exact strings. `http://host:1` and `http://host:1/`
//! are distinct entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Origin already exists: {0}")]
    DuplicateOrigin(String),
    #[error("Origin file is corrupt: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A trusted origin with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedOrigin {
    pub id: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TrustedOrigin {
    fn new(origin: &str, description: Option<&str>) -> Self {
        Self {
            id: format!("origin-{}", Uuid::new_v4()),
            origin: origin.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

/// Storage seam for the trusted-origin collection
#[async_trait]
pub trait OriginStore: Send + Sync {
    /// All records, in insertion order
    async fn list(&self) -> Result<Vec<TrustedOrigin>, RegistryError>;

    /// Add an origin; exact duplicates are rejected
    async fn add(
        &self,
        origin: &str,
        description: Option<&str>,
    ) -> Result<TrustedOrigin, RegistryError>;

    /// Remove by id. Returns `false` when no record had that id.
    async fn remove(&self, id: &str) -> Result<bool, RegistryError>;

    /// Origin strings only, as consulted by the origin gate
    async fn list_origin_strings(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.list().await?.into_iter().map(|o| o.origin).collect())
    }
}

/// Allow-list stored as a JSON array in a single file
pub struct JsonFileOriginStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileOriginStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory and an empty collection if missing
    async fn ensure_file(&self) -> Result<(), RegistryError> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_all(&[]).await?;
        info!(path = %self.path.display(), "Created new allowed-origins file");

        Ok(())
    }

    /// Callers hold `write_lock` so bootstrap cannot race a mutation
    async fn read_all(&self) -> Result<Vec<TrustedOrigin>, RegistryError> {
        self.ensure_file().await?;
        let data = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&data).map_err(|e| RegistryError::Corrupt(e.to_string()))
    }

    async fn write_all(&self, origins: &[TrustedOrigin]) -> Result<(), RegistryError> {
        let data = serde_json::to_string_pretty(origins)?;

        // Write atomically via temp file
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, data).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }
}

#[async_trait]
impl OriginStore for JsonFileOriginStore {
    async fn list(&self) -> Result<Vec<TrustedOrigin>, RegistryError> {
        let _guard = self.write_lock.lock().await;
        match self.read_all().await {
            Err(RegistryError::Corrupt(e)) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable origins file, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn add(
        &self,
        origin: &str,
        description: Option<&str>,
    ) -> Result<TrustedOrigin, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut origins = self.read_all().await?;

        if origins.iter().any(|o| o.origin == origin) {
            return Err(RegistryError::DuplicateOrigin(origin.to_string()));
        }

        let record = TrustedOrigin::new(origin, description);
        origins.push(record.clone());
        self.write_all(&origins).await?;

        info!(origin, id = %record.id, "Added custom origin");
        Ok(record)
    }

    async fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let origins = self.read_all().await?;
        let before = origins.len();
        let remaining: Vec<TrustedOrigin> = origins.into_iter().filter(|o| o.id != id).collect();

        if remaining.len() == before {
            return Ok(false);
        }

        self.write_all(&remaining).await?;
        info!(id, "Removed custom origin");
        Ok(true)
    }
}

/// Allow-list held in memory only
#[derive(Default)]
pub struct MemoryOriginStore {
    origins: RwLock<Vec<TrustedOrigin>>,
}

impl MemoryOriginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with plain origin strings
    pub fn with_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        {
            let mut list = store.origins.write();
            for origin in origins {
                let origin = origin.as_ref();
                if !list.iter().any(|o| o.origin == origin) {
                    list.push(TrustedOrigin::new(origin, None));
                }
            }
        }
        store
    }
}

#[async_trait]
impl OriginStore for MemoryOriginStore {
    async fn list(&self) -> Result<Vec<TrustedOrigin>, RegistryError> {
        Ok(self.origins.read().clone())
    }

    async fn add(
        &self,
        origin: &str,
        description: Option<&str>,
    ) -> Result<TrustedOrigin, RegistryError> {
        let mut origins = self.origins.write();
        if origins.iter().any(|o| o.origin == origin) {
            return Err(RegistryError::DuplicateOrigin(origin.to_string()));
        }

        let record = TrustedOrigin::new(origin, description);
        origins.push(record.clone());
        Ok(record)
    }

    async fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut origins = self.origins.write();
        let before = origins.len();
        origins.retain(|o| o.id != id);
        Ok(origins.len() != before)
    }
}
