//! Storage backends for device descriptors and poll output
//!
//! This module provides a trait-based abstraction over where devices come
//! from and where poll results go.
//!
//! ## Design
//!
//! - **Trait-based**: `DeviceRepository` and `MetricsStore` allow swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Idempotent sessions**: Role entities are upserted by natural key
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with WAL and migrations
//! - **In-Memory** (fallback): No persistence, for testing or dry runs
//!
//! ## Usage
//!
//! ```no_run
//! use ispmon::storage::sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::new("./ispmon.db").await?;
//!     // Hand to PollerHandle::spawn as both repository and store
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{DeviceRepository, HealthStatus, MetricsStore};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use schema::{HistoryRecord, SystemMetricsRow};

use crate::config::StorageConfig;

/// Both storage roles, backed by the same instance
#[derive(Clone)]
pub struct Storage {
    pub devices: Arc<dyn DeviceRepository>,
    pub metrics: Arc<dyn MetricsStore>,
}

impl Storage {
    fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: DeviceRepository + MetricsStore + 'static,
    {
        Self {
            devices: backend.clone(),
            metrics: backend,
        }
    }
}

/// Open the backend selected by `config`, in-memory when none is configured
pub async fn open(config: Option<&StorageConfig>) -> StorageResult<Storage> {
    match config {
        None | Some(StorageConfig::None) => {
            info!("using in-memory storage, nothing will be persisted");
            Ok(Storage::from_backend(Arc::new(MemoryStore::new())))
        }
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path }) => {
            let store = sqlite::SqliteStore::new(path).await?;
            Ok(Storage::from_backend(Arc::new(store)))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => Err(StorageError::InvalidConfig(
            "sqlite backend requires the storage-sqlite feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_open_without_config_is_in_memory() {
        let storage = open(None).await.unwrap();
        let due = storage.devices.list_due(Utc::now(), 10).await.unwrap();
        assert!(due.is_empty());
        let health = storage.metrics.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.message.starts_with("in-memory"));
    }

    #[cfg(feature = "storage-sqlite")]
    #[tokio::test]
    async fn test_open_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::Sqlite {
            path: dir.path().join("open.db"),
        };
        let storage = open(Some(&config)).await.unwrap();
        assert!(storage.metrics.health_check().await.unwrap().healthy);
    }
}
