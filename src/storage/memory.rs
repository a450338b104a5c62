//! In-memory storage backend (no persistence)
//!
//! Implements both storage traits behind a single `tokio::sync::RwLock`.
//! Used for `"backend": "none"` and throughout the tests.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: metrics points and history are kept in per-device
//!   ring buffers; the oldest entries are evicted first
//! - **Sessions are a snapshot**: each non-empty batch replaces what was
//!   stored for that device and kind

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{DeviceRepository, HealthStatus, MetricsStore};
use super::error::{StorageError, StorageResult};
use super::schema::{HistoryRecord, SystemMetricsRow};
use crate::device::{CapabilitySet, Device, RoleAssignment};
use crate::poll_result::{PollResult, SessionBatch};

/// Maximum metrics points kept per device
const MAX_METRICS_PER_DEVICE: usize = 1000;

/// Maximum history records kept per device
const MAX_HISTORY_PER_DEVICE: usize = 10_000;

struct DeviceEntry {
    device: Device,
    capabilities: Option<CapabilitySet>,
    roles: Vec<RoleAssignment>,
    consecutive_failures: u32,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<Uuid, DeviceEntry>,
    metrics: HashMap<Uuid, VecDeque<SystemMetricsRow>>,
    history: HashMap<Uuid, VecDeque<HistoryRecord>>,
    /// Session/lease payloads per (device, kind), keyed by natural key
    sessions: HashMap<(Uuid, &'static str), HashMap<String, serde_json::Value>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities of one kind ("pppoe", "nat", "dhcp") for a device
    pub async fn session_count(&self, device_id: Uuid, kind: &str) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .filter(|((device, k), _)| *device == device_id && *k == kind)
            .map(|(_, entities)| entities.len())
            .sum()
    }

    /// Stored payloads of one kind for a device, in no particular order
    pub async fn sessions(&self, device_id: Uuid, kind: &str) -> Vec<serde_json::Value> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .filter(|((device, k), _)| *device == device_id && *k == kind)
            .flat_map(|(_, entities)| entities.values().cloned())
            .collect()
    }

    pub async fn latest_metrics(&self, device_id: Uuid) -> Option<SystemMetricsRow> {
        self.inner
            .read()
            .await
            .metrics
            .get(&device_id)
            .and_then(|points| points.back().cloned())
    }

    pub async fn consecutive_failures(&self, device_id: Uuid) -> Option<u32> {
        self.inner
            .read()
            .await
            .devices
            .get(&device_id)
            .map(|entry| entry.consecutive_failures)
    }
}

/// Natural keys of every entity in a batch, with its JSON payload
fn keyed_entities(batch: &SessionBatch) -> StorageResult<Vec<(String, serde_json::Value)>> {
    let entities = match batch {
        SessionBatch::Pppoe(sessions) => sessions
            .iter()
            .map(|s| Ok((s.session_id.clone(), serde_json::to_value(s)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?,
        SessionBatch::Nat(sessions) => sessions
            .iter()
            .map(|s| Ok((s.natural_key(), serde_json::to_value(s)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?,
        SessionBatch::Dhcp(leases) => leases
            .iter()
            .map(|l| {
                Ok((
                    format!("{}|{}", l.mac_address, l.ip_address),
                    serde_json::to_value(l)?,
                ))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?,
    };
    Ok(entities)
}

#[async_trait]
impl DeviceRepository for MemoryStore {
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Device>> {
        let inner = self.inner.read().await;

        let mut due: Vec<&Device> = inner
            .devices
            .values()
            .map(|entry| &entry.device)
            .filter(|device| device.is_due(now))
            .collect();

        // None sorts before Some, so never-polled devices come first
        due.sort_by(|a, b| {
            a.last_polled_at
                .cmp(&b.last_polled_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        trace!("{} devices due, returning at most {limit}", due.len());
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn get_device(&self, device_id: Uuid) -> StorageResult<Option<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .get(&device_id)
            .map(|entry| entry.device.clone()))
    }

    async fn load_capabilities(&self, device_id: Uuid) -> StorageResult<Option<CapabilitySet>> {
        let inner = self.inner.read().await;
        let entry = inner
            .devices
            .get(&device_id)
            .ok_or(StorageError::DeviceNotFound(device_id))?;
        Ok(entry.capabilities.clone())
    }

    async fn load_roles(&self, device_id: Uuid) -> StorageResult<Vec<RoleAssignment>> {
        let inner = self.inner.read().await;
        let entry = inner
            .devices
            .get(&device_id)
            .ok_or(StorageError::DeviceNotFound(device_id))?;

        let mut roles = entry.roles.clone();
        roles.sort_by_key(|role| role.priority);
        Ok(roles)
    }

    async fn mark_polled(&self, device_id: Uuid, polled_at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .devices
            .get_mut(&device_id)
            .ok_or(StorageError::DeviceNotFound(device_id))?;

        entry.device.last_polled_at = Some(polled_at);
        entry.consecutive_failures = 0;
        Ok(())
    }

    async fn record_failure(&self, device_id: Uuid) -> StorageResult<u32> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .devices
            .get_mut(&device_id)
            .ok_or(StorageError::DeviceNotFound(device_id))?;

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        Ok(entry.consecutive_failures)
    }

    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        let mut inner = self.inner.write().await;

        let mut stored = device.clone();
        let capabilities = stored.capabilities.take();
        let roles = std::mem::take(&mut stored.roles);

        let (consecutive_failures, last_polled_at) = inner
            .devices
            .get(&device.id)
            .map(|entry| (entry.consecutive_failures, entry.device.last_polled_at))
            .unwrap_or_default();
        stored.last_polled_at = stored.last_polled_at.or(last_polled_at);

        inner.devices.insert(
            device.id,
            DeviceEntry {
                device: stored,
                capabilities,
                roles,
                consecutive_failures,
            },
        );
        debug!("stored device {} ({})", device.name, device.id);
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn write_system_metrics(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
        result: &PollResult,
    ) -> StorageResult<()> {
        let row = SystemMetricsRow::from_result(tenant_id, device_id, timestamp, result);

        let mut inner = self.inner.write().await;
        let points = inner.metrics.entry(device_id).or_default();
        if points.len() >= MAX_METRICS_PER_DEVICE {
            points.pop_front();
        }
        points.push_back(row);
        Ok(())
    }

    async fn write_history(&self, record: HistoryRecord) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let history = inner.history.entry(record.device_id).or_default();
        if history.len() >= MAX_HISTORY_PER_DEVICE {
            history.pop_front();
        }
        history.push_back(record);
        Ok(())
    }

    async fn upsert_sessions(
        &self,
        _tenant_id: Uuid,
        device_id: Uuid,
        batch: SessionBatch,
    ) -> StorageResult<usize> {
        let kind = batch.kind();
        let entities = keyed_entities(&batch)?;

        let count = entities.len();
        if count == 0 {
            return Ok(0);
        }

        // later duplicates of a natural key overwrite earlier ones
        let snapshot: HashMap<String, serde_json::Value> = entities.into_iter().collect();

        let mut inner = self.inner.write().await;
        let stale = inner
            .sessions
            .insert((device_id, kind), snapshot)
            .map(|previous| previous.len())
            .unwrap_or(0);

        trace!("upserted {count} {kind} entities for {device_id}, replaced {stale}");
        Ok(count)
    }

    async fn query_history(
        &self,
        device_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .get(&device_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;

        let mut metadata = HashMap::new();
        metadata.insert("devices".to_string(), inner.devices.len().to_string());
        let sessions: usize = inner.sessions.values().map(HashMap::len).sum();
        metadata.insert("sessions".to_string(), sessions.to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory storage operational".to_string(),
            metadata,
        })
    }
}
