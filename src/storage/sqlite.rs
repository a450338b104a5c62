//! SQLite storage backend implementation
//!
//! Implements both [`DeviceRepository`] and [`MetricsStore`] on one pool.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds and UUIDs as text. Capability
//! sets are stored as one JSON document per device.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use super::backend::{DeviceRepository, HealthStatus, MetricsStore};
use super::error::{StorageError, StorageResult};
use super::schema::{HistoryRecord, SystemMetricsRow};
use crate::device::{CapabilitySet, Device, DeviceStatus, RoleAssignment};
use crate::poll_result::{PollResult, SessionBatch};

const DEVICE_COLUMNS: &str = "id, tenant_id, name, management_ip, vendor, status, \
     polling_enabled, polling_interval_secs, last_polled_at";

/// Table holding one session kind ("pppoe", "nat", "dhcp")
fn session_table(kind: &str) -> Option<&'static str> {
    match kind {
        "pppoe" => Some("pppoe_sessions"),
        "nat" => Some("nat_sessions"),
        "dhcp" => Some("dhcp_leases"),
        _ => None,
    }
}

/// SQLite storage backend
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn parse_uuid(raw: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(raw)
            .map_err(|e| StorageError::SerializationError(format!("invalid uuid {raw}: {e}")))
    }

    fn device_from_row(row: &SqliteRow) -> StorageResult<Device> {
        let id: String = row.try_get("id")?;
        let tenant_id: String = row.try_get("tenant_id")?;
        let management_ip: String = row.try_get("management_ip")?;
        let status: String = row.try_get("status")?;
        let interval: i64 = row.try_get("polling_interval_secs")?;
        let last_polled_at: Option<i64> = row.try_get("last_polled_at")?;

        Ok(Device {
            id: Self::parse_uuid(&id)?,
            tenant_id: Self::parse_uuid(&tenant_id)?,
            name: row.try_get("name")?,
            management_ip: management_ip.parse().map_err(|e| {
                StorageError::SerializationError(format!("invalid address {management_ip}: {e}"))
            })?,
            vendor: row.try_get("vendor")?,
            status: status.parse::<DeviceStatus>().map_err(StorageError::SerializationError)?,
            polling_enabled: row.try_get("polling_enabled")?,
            polling_interval_secs: u32::try_from(interval).unwrap_or(u32::MAX),
            last_polled_at: last_polled_at.map(Self::millis_to_timestamp),
            capabilities: None,
            roles: vec![],
        })
    }

    fn history_from_row(row: &SqliteRow) -> StorageResult<HistoryRecord> {
        let tenant_id: String = row.try_get("tenant_id")?;
        let device_id: String = row.try_get("device_id")?;
        let metrics_collected: i64 = row.try_get("metrics_collected")?;
        let response_time_ms: i64 = row.try_get("response_time_ms")?;

        Ok(HistoryRecord {
            tenant_id: Self::parse_uuid(&tenant_id)?,
            device_id: Self::parse_uuid(&device_id)?,
            poll_started_at: Self::millis_to_timestamp(row.try_get("poll_started_at")?),
            poll_completed_at: Self::millis_to_timestamp(row.try_get("poll_completed_at")?),
            adapter_used: row.try_get("adapter_used")?,
            success: row.try_get("success")?,
            error_message: row.try_get("error_message")?,
            metrics_collected: u32::try_from(metrics_collected).unwrap_or(0),
            response_time_ms: u64::try_from(response_time_ms).unwrap_or(0),
        })
    }

    /// Number of stored entities of one kind ("pppoe", "nat", "dhcp") for a device
    pub async fn session_count(&self, device_id: Uuid, kind: &str) -> StorageResult<usize> {
        let table = session_table(kind)
            .ok_or_else(|| StorageError::QueryFailed(format!("unknown session kind {kind}")))?;

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE device_id = ?"
        ))
        .bind(device_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Most recent system metrics point of a device
    pub async fn latest_metrics(&self, device_id: Uuid) -> StorageResult<Option<SystemMetricsRow>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, device_id, timestamp, adapter, cpu_percent, memory_percent,
                   uptime_seconds, temperature_celsius, metrics, interfaces
            FROM system_metrics
            WHERE device_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tenant_id: String = row.try_get("tenant_id")?;
        let metrics: String = row.try_get("metrics")?;
        let interfaces: String = row.try_get("interfaces")?;

        Ok(Some(SystemMetricsRow {
            tenant_id: Self::parse_uuid(&tenant_id)?,
            device_id,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
            adapter: row.try_get("adapter")?,
            cpu_percent: row.try_get("cpu_percent")?,
            memory_percent: row.try_get("memory_percent")?,
            uptime_seconds: row.try_get("uptime_seconds")?,
            temperature_celsius: row.try_get("temperature_celsius")?,
            metrics: serde_json::from_str(&metrics)?,
            interfaces: serde_json::from_str(&interfaces)?,
        }))
    }

    pub async fn consecutive_failures(&self, device_id: Uuid) -> StorageResult<Option<u32>> {
        let failures: Option<i64> =
            sqlx::query_scalar("SELECT consecutive_failures FROM devices WHERE id = ?")
                .bind(device_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(failures.map(|n| u32::try_from(n).unwrap_or(0)))
    }
}

#[async_trait]
impl DeviceRepository for SqliteStore {
    #[instrument(skip(self))]
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Device>> {
        let sql = format!(
            r#"
            SELECT {DEVICE_COLUMNS}
            FROM devices
            WHERE polling_enabled = 1
              AND status = 'active'
              AND (last_polled_at IS NULL OR last_polled_at + polling_interval_secs * 1000 < ?)
            ORDER BY last_polled_at IS NOT NULL, last_polled_at ASC, id ASC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(Self::timestamp_to_millis(&now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::device_from_row).collect()
    }

    async fn get_device(&self, device_id: Uuid) -> StorageResult<Option<Device>> {
        let row = sqlx::query(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
            .bind(device_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::device_from_row).transpose()
    }

    async fn load_capabilities(&self, device_id: Uuid) -> StorageResult<Option<CapabilitySet>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM device_capabilities WHERE device_id = ?")
                .bind(device_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        payload
            .map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    async fn load_roles(&self, device_id: Uuid) -> StorageResult<Vec<RoleAssignment>> {
        let rows = sqlx::query(
            r#"
            SELECT role_code, role_name, priority, is_primary
            FROM device_roles
            WHERE device_id = ?
            ORDER BY priority ASC, role_code ASC
            "#,
        )
        .bind(device_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let priority: i64 = row.try_get("priority")?;
                Ok(RoleAssignment {
                    code: row.try_get("role_code")?,
                    name: row.try_get("role_name")?,
                    priority: i32::try_from(priority).unwrap_or(i32::MAX),
                    is_primary: row.try_get("is_primary")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn mark_polled(&self, device_id: Uuid, polled_at: DateTime<Utc>) -> StorageResult<()> {
        let updated = sqlx::query(
            "UPDATE devices SET last_polled_at = ?, consecutive_failures = 0, updated_at = ? WHERE id = ?",
        )
        .bind(Self::timestamp_to_millis(&polled_at))
        .bind(Self::timestamp_to_millis(&Utc::now()))
        .bind(device_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::DeviceNotFound(device_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_failure(&self, device_id: Uuid) -> StorageResult<u32> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE devices
            SET consecutive_failures = consecutive_failures + 1
            WHERE id = ?
            RETURNING consecutive_failures
            "#,
        )
        .bind(device_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        failures
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .ok_or(StorageError::DeviceNotFound(device_id))
    }

    #[instrument(skip_all, fields(device = %device.name))]
    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        let now = Self::timestamp_to_millis(&Utc::now());
        let id = device.id.to_string();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO devices (
                id, tenant_id, name, management_ip, vendor, status,
                polling_enabled, polling_interval_secs, last_polled_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                management_ip = excluded.management_ip,
                vendor = excluded.vendor,
                status = excluded.status,
                polling_enabled = excluded.polling_enabled,
                polling_interval_secs = excluded.polling_interval_secs,
                last_polled_at = COALESCE(excluded.last_polled_at, devices.last_polled_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(device.tenant_id.to_string())
        .bind(&device.name)
        .bind(device.management_ip.to_string())
        .bind(&device.vendor)
        .bind(device.status.to_string())
        .bind(device.polling_enabled)
        .bind(i64::from(device.polling_interval_secs))
        .bind(device.last_polled_at.as_ref().map(Self::timestamp_to_millis))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        match &device.capabilities {
            Some(capabilities) => {
                let payload = serde_json::to_string(capabilities)?;
                sqlx::query(
                    r#"
                    INSERT INTO device_capabilities (device_id, payload, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT (device_id) DO UPDATE SET
                        payload = excluded.payload,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&id)
                .bind(payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM device_capabilities WHERE device_id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM device_roles WHERE device_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        for role in &device.roles {
            sqlx::query(
                r#"
                INSERT INTO device_roles (device_id, role_code, role_name, priority, is_primary)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (device_id, role_code) DO UPDATE SET
                    role_name = excluded.role_name,
                    priority = excluded.priority,
                    is_primary = excluded.is_primary
                "#,
            )
            .bind(&id)
            .bind(&role.code)
            .bind(&role.name)
            .bind(i64::from(role.priority))
            .bind(role.is_primary)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("stored device {}", device.id);
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    #[instrument(skip(self, result))]
    async fn write_system_metrics(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
        result: &PollResult,
    ) -> StorageResult<()> {
        let row = SystemMetricsRow::from_result(tenant_id, device_id, timestamp, result);
        let metrics_json = serde_json::to_string(&row.metrics)?;
        let interfaces_json = serde_json::to_string(&row.interfaces)?;

        sqlx::query(
            r#"
            INSERT INTO system_metrics (
                tenant_id, device_id, timestamp, adapter, cpu_percent, memory_percent,
                uptime_seconds, temperature_celsius, metrics, interfaces
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(device_id.to_string())
        .bind(Self::timestamp_to_millis(&row.timestamp))
        .bind(&row.adapter)
        .bind(row.cpu_percent)
        .bind(row.memory_percent)
        .bind(row.uptime_seconds)
        .bind(row.temperature_celsius)
        .bind(metrics_json)
        .bind(interfaces_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(device_id = %record.device_id))]
    async fn write_history(&self, record: HistoryRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO polling_history (
                tenant_id, device_id, poll_started_at, poll_completed_at, adapter_used,
                success, error_message, metrics_collected, response_time_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.tenant_id.to_string())
        .bind(record.device_id.to_string())
        .bind(Self::timestamp_to_millis(&record.poll_started_at))
        .bind(Self::timestamp_to_millis(&record.poll_completed_at))
        .bind(&record.adapter_used)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(i64::from(record.metrics_collected))
        .bind(i64::try_from(record.response_time_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, batch), fields(kind = batch.kind(), count = batch.len()))]
    async fn upsert_sessions(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        batch: SessionBatch,
    ) -> StorageResult<usize> {
        let tenant = tenant_id.to_string();
        let device = device_id.to_string();
        let count = batch.len();
        let table = session_table(batch.kind())
            .ok_or_else(|| StorageError::QueryFailed(format!("unknown session kind {}", batch.kind())))?;

        let mut tx = self.pool.begin().await?;

        // every batch gets a strictly newer stamp so stale rows can be told apart
        let previous: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(last_seen), 0) FROM {table} WHERE device_id = ?"
        ))
        .bind(&device)
        .fetch_one(&mut *tx)
        .await?;
        let now = Self::timestamp_to_millis(&Utc::now()).max(previous + 1);

        match batch {
            SessionBatch::Pppoe(sessions) => {
                for session in sessions {
                    sqlx::query(
                        r#"
                        INSERT INTO pppoe_sessions (
                            device_id, session_id, tenant_id, username, caller_id,
                            address, uptime_seconds, first_seen, last_seen
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT (device_id, session_id) DO UPDATE SET
                            username = excluded.username,
                            caller_id = excluded.caller_id,
                            address = excluded.address,
                            uptime_seconds = excluded.uptime_seconds,
                            last_seen = excluded.last_seen
                        "#,
                    )
                    .bind(&device)
                    .bind(&session.session_id)
                    .bind(&tenant)
                    .bind(&session.username)
                    .bind(&session.caller_id)
                    .bind(&session.address)
                    .bind(session.uptime_seconds.map(|s| i64::try_from(s).unwrap_or(i64::MAX)))
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            SessionBatch::Nat(sessions) => {
                for session in sessions {
                    sqlx::query(
                        r#"
                        INSERT INTO nat_sessions (
                            device_id, natural_key, tenant_id, protocol, src_address,
                            dst_address, reply_src_address, state, first_seen, last_seen
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT (device_id, natural_key) DO UPDATE SET
                            reply_src_address = excluded.reply_src_address,
                            state = excluded.state,
                            last_seen = excluded.last_seen
                        "#,
                    )
                    .bind(&device)
                    .bind(session.natural_key())
                    .bind(&tenant)
                    .bind(&session.protocol)
                    .bind(&session.src_address)
                    .bind(&session.dst_address)
                    .bind(&session.reply_src_address)
                    .bind(&session.state)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            SessionBatch::Dhcp(leases) => {
                for lease in leases {
                    sqlx::query(
                        r#"
                        INSERT INTO dhcp_leases (
                            device_id, mac_address, ip_address, tenant_id, hostname,
                            active, first_seen, last_seen
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT (device_id, mac_address, ip_address) DO UPDATE SET
                            hostname = excluded.hostname,
                            active = excluded.active,
                            last_seen = excluded.last_seen
                        "#,
                    )
                    .bind(&device)
                    .bind(&lease.mac_address)
                    .bind(&lease.ip_address)
                    .bind(&tenant)
                    .bind(&lease.hostname)
                    .bind(lease.active)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        // a batch is the device's full current view: whatever it no longer reports is gone
        if count > 0 {
            let pruned = sqlx::query(&format!(
                "DELETE FROM {table} WHERE device_id = ? AND last_seen < ?"
            ))
            .bind(&device)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if pruned > 0 {
                trace!("pruned {pruned} stale rows from {table} for {device_id}");
            }
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn query_history(
        &self,
        device_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, device_id, poll_started_at, poll_completed_at, adapter_used,
                   success, error_message, metrics_collected, response_time_ms
            FROM polling_history
            WHERE device_id = ?
            ORDER BY poll_started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::history_from_row).collect()
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::UnhealthyBackend(e.to_string()))?;

        let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("path".to_string(), self.db_path.clone());
        metadata.insert("devices".to_string(), devices.to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "SQLite backend operational".to_string(),
            metadata,
        })
    }
}
