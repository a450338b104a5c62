//! Row definitions shared by all storage backends
//!
//! ## Hybrid system metrics
//!
//! The generic metric bag is open-ended, so a system metrics point keeps the
//! few aggregates dashboards query on as typed columns and the complete bag
//! (plus interface statuses) as JSON:
//!
//! - `cpu_percent`, `memory_percent`, `uptime_seconds`, `temperature_celsius`
//!   are lifted out of the bag when present
//! - `metrics` and `interfaces` hold everything, so adding a metric key never
//!   needs a migration

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::poll_result::{InterfaceStatus, MetricValue, PollResult, keys};

/// One append-only audit entry per poll attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub poll_started_at: DateTime<Utc>,
    pub poll_completed_at: DateTime<Utc>,

    /// Adapter that produced the result, "none" if no adapter did
    pub adapter_used: String,

    pub success: bool,
    pub error_message: Option<String>,
    pub metrics_collected: u32,
    pub response_time_ms: u64,
}

impl From<&PollResult> for HistoryRecord {
    fn from(result: &PollResult) -> Self {
        Self {
            tenant_id: result.tenant_id,
            device_id: result.device_id,
            poll_started_at: result.started_at,
            poll_completed_at: result.completed_at,
            adapter_used: result.adapter.clone(),
            success: result.success,
            error_message: result.error.clone(),
            metrics_collected: u32::try_from(result.metrics_count()).unwrap_or(u32::MAX),
            response_time_ms: result.response_time_ms,
        }
    }
}

/// A single system metrics point for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetricsRow {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub adapter: String,

    // === Aggregates (frequently queried) ===
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub uptime_seconds: Option<i64>,
    pub temperature_celsius: Option<f64>,

    // === Full detail (JSON in SQL backends) ===
    pub metrics: BTreeMap<String, MetricValue>,
    pub interfaces: Vec<InterfaceStatus>,
}

impl SystemMetricsRow {
    pub fn from_result(
        tenant_id: Uuid,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
        result: &PollResult,
    ) -> Self {
        let float = |key: &str| result.metric(key).and_then(MetricValue::as_f64);

        Self {
            tenant_id,
            device_id,
            timestamp,
            adapter: result.adapter.clone(),
            cpu_percent: float(keys::CPU_PERCENT),
            memory_percent: float(keys::MEMORY_PERCENT),
            uptime_seconds: result.metric(keys::UPTIME_SECONDS).and_then(MetricValue::as_i64),
            // sensors reporting 0 are absent
            temperature_celsius: float(keys::TEMPERATURE_CELSIUS).filter(|t| *t > 0.0),
            metrics: result.metrics.clone(),
            interfaces: result.interfaces.clone(),
        }
    }
}
