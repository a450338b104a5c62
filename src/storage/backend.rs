//! Storage trait definitions
//!
//! The polling engine talks to storage through two traits:
//!
//! - [`DeviceRepository`]: device descriptors, capabilities, roles and the
//!   per-device polling bookkeeping
//! - [`MetricsStore`]: system metrics points, polling history and
//!   role-specific session tables
//!
//! Both backends (`MemoryStore`, `SqliteStore`) implement both traits on one
//! type, so a single `Arc` can be handed out as either.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::HistoryRecord;
use crate::device::{CapabilitySet, Device, RoleAssignment};
use crate::poll_result::{PollResult, SessionBatch};

/// Health status of a storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Source of device descriptors and owner of the polling bookkeeping
///
/// Only the result processor calls `mark_polled` and `record_failure`; the
/// scheduler only reads.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Devices due at `now`, never-polled first, then oldest poll first
    ///
    /// Due means polling enabled, status active and either never polled or
    /// `last_polled_at + interval < now`. Returned descriptors carry no
    /// capabilities or roles yet.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Device>>;

    async fn get_device(&self, device_id: Uuid) -> StorageResult<Option<Device>>;

    async fn load_capabilities(&self, device_id: Uuid) -> StorageResult<Option<CapabilitySet>>;

    async fn load_roles(&self, device_id: Uuid) -> StorageResult<Vec<RoleAssignment>>;

    /// Advance `last_polled_at` and reset the consecutive failure counter
    async fn mark_polled(&self, device_id: Uuid, polled_at: DateTime<Utc>) -> StorageResult<()>;

    /// Bump the consecutive failure counter, returning the new value
    async fn record_failure(&self, device_id: Uuid) -> StorageResult<u32>;

    /// Insert or replace a device together with its capabilities and roles
    async fn upsert_device(&self, device: &Device) -> StorageResult<()>;
}

/// Sink for everything a poll produces
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Append one system metrics point built from a successful result
    async fn write_system_metrics(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
        result: &PollResult,
    ) -> StorageResult<()>;

    /// Append a history record (never deduplicated)
    async fn write_history(&self, record: HistoryRecord) -> StorageResult<()>;

    /// Upsert role entities by natural key, returning how many were written
    async fn upsert_sessions(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        batch: SessionBatch,
    ) -> StorageResult<usize>;

    /// Most recent history records of a device, newest first
    async fn query_history(&self, device_id: Uuid, limit: usize)
    -> StorageResult<Vec<HistoryRecord>>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
