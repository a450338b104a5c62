//! Integration tests for the polling pipeline

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/pipeline.rs"]
mod pipeline;

#[path = "integration/mikrotik_adapter.rs"]
mod mikrotik_adapter;

#[cfg(feature = "storage-sqlite")]
#[path = "integration/storage_persistence.rs"]
mod storage_persistence;
