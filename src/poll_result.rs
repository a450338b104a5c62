//! Normalized, protocol-agnostic output of one polling attempt
//!
//! A [`PollResult`] is created empty when an attempt starts, filled in by an
//! adapter, and consumed exactly once by the result processor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::Device;

/// Adapter name recorded when no adapter produced the result
pub const NO_ADAPTER: &str = "none";

/// Well-known keys in the generic metric bag
pub mod keys {
    pub const SYSTEM_DESCRIPTION: &str = "system_description";
    pub const SYSTEM_NAME: &str = "system_name";
    pub const UPTIME_SECONDS: &str = "uptime_seconds";
    pub const INTERFACE_COUNT: &str = "interface_count";
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const MEMORY_TOTAL_MB: &str = "memory_total_mb";
    pub const MEMORY_USED_MB: &str = "memory_used_mb";
    pub const MEMORY_FREE_MB: &str = "memory_free_mb";
    pub const TEMPERATURE_CELSIUS: &str = "temperature_celsius";
    pub const BOARD_NAME: &str = "board_name";
    pub const FIRMWARE_VERSION: &str = "firmware_version";
    pub const PPPOE_ACTIVE_SESSIONS: &str = "pppoe_active_sessions";
    pub const NAT_TOTAL_SESSIONS: &str = "nat_total_sessions";
    pub const DHCP_LEASE_COUNT: &str = "dhcp_lease_count";
}

/// A dynamically-typed scalar metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Integer(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Integer(v) => Some(*v),
            MetricValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Bool(v) => write!(f, "{v}"),
            MetricValue::Integer(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Bool(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub name: String,
    #[serde(default)]
    pub index: Option<u32>,
    pub oper_up: bool,
    #[serde(default)]
    pub admin_up: bool,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
}

/// An active PPPoE subscriber session; natural key is `session_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PppoeSession {
    pub session_id: String,
    pub username: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}

/// A NAT translation entry; natural key is the (protocol, src, dst) tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatSession {
    pub protocol: String,
    pub src_address: String,
    pub dst_address: String,
    #[serde(default)]
    pub reply_src_address: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl NatSession {
    pub fn natural_key(&self) -> String {
        format!("{}|{}|{}", self.protocol, self.src_address, self.dst_address)
    }
}

/// A DHCP lease; natural key is MAC + IP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub mac_address: String,
    pub ip_address: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub active: bool,
}

/// Role-specific entities of one kind, handed to the store as a unit
#[derive(Debug, Clone, PartialEq)]
pub enum SessionBatch {
    Pppoe(Vec<PppoeSession>),
    Nat(Vec<NatSession>),
    Dhcp(Vec<DhcpLease>),
}

impl SessionBatch {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionBatch::Pppoe(_) => "pppoe",
            SessionBatch::Nat(_) => "nat",
            SessionBatch::Dhcp(_) => "dhcp",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SessionBatch::Pppoe(v) => v.len(),
            SessionBatch::Nat(v) => v.len(),
            SessionBatch::Dhcp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one polling attempt against one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub device_id: Uuid,
    pub tenant_id: Uuid,

    /// Adapter that produced the result, or [`NO_ADAPTER`]
    pub adapter: String,

    pub success: bool,

    pub metrics: BTreeMap<String, MetricValue>,

    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,

    #[serde(default)]
    pub pppoe_sessions: Vec<PppoeSession>,

    #[serde(default)]
    pub nat_sessions: Vec<NatSession>,

    #[serde(default)]
    pub dhcp_leases: Vec<DhcpLease>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub response_time_ms: u64,

    #[serde(default)]
    pub error: Option<String>,

    /// Attempt was cut short by shutdown rather than failing on its own
    #[serde(default)]
    pub cancelled: bool,
}

impl PollResult {
    /// Fresh, not-yet-successful result for an attempt starting now
    pub fn start(device: &Device, adapter: &str) -> Self {
        let now = Utc::now();
        Self {
            device_id: device.id,
            tenant_id: device.tenant_id,
            adapter: adapter.to_string(),
            success: false,
            metrics: BTreeMap::new(),
            interfaces: vec![],
            pppoe_sessions: vec![],
            nat_sessions: vec![],
            dhcp_leases: vec![],
            started_at: now,
            completed_at: now,
            response_time_ms: 0,
            error: None,
            cancelled: false,
        }
    }

    /// Failure result with adapter "none", used when no adapter produced anything
    pub fn failed(device: &Device, error: impl Into<String>) -> Self {
        let mut result = Self::start(device, NO_ADAPTER);
        result.fail(error);
        result
    }

    pub fn set_metric(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.metrics.insert(key.to_string(), value.into());
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    /// Stamp completion time and latency
    pub fn finish(&mut self) {
        self.completed_at = Utc::now();
        self.response_time_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }

    pub fn succeed(&mut self) {
        self.success = true;
        self.error = None;
        self.finish();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.finish();
    }

    /// Number of collected data points, counting every role entity and interface
    pub fn metrics_count(&self) -> usize {
        self.metrics.len()
            + self.interfaces.len()
            + self.pppoe_sessions.len()
            + self.nat_sessions.len()
            + self.dhcp_leases.len()
    }

    /// Role collections present in this result, one batch per non-empty kind
    pub fn session_batches(&self) -> Vec<SessionBatch> {
        let mut batches = Vec::new();
        if !self.pppoe_sessions.is_empty() {
            batches.push(SessionBatch::Pppoe(self.pppoe_sessions.clone()));
        }
        if !self.nat_sessions.is_empty() {
            batches.push(SessionBatch::Nat(self.nat_sessions.clone()));
        }
        if !self.dhcp_leases.is_empty() {
            batches.push(SessionBatch::Dhcp(self.dhcp_leases.clone()));
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;

    fn device() -> Device {
        Device {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "r1".to_string(),
            management_ip: "192.0.2.1".parse().unwrap(),
            vendor: None,
            status: DeviceStatus::Active,
            polling_enabled: true,
            polling_interval_secs: 60,
            last_polled_at: None,
            capabilities: None,
            roles: vec![],
        }
    }

    #[test]
    fn test_failed_result_uses_none_adapter() {
        let d = device();
        let result = PollResult::failed(&d, "no suitable adapter");

        assert_eq!(result.adapter, NO_ADAPTER);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no suitable adapter"));
        assert_eq!(result.device_id, d.id);
        assert_eq!(result.tenant_id, d.tenant_id);
    }

    #[test]
    fn test_metrics_count_includes_collections() {
        let mut result = PollResult::start(&device(), "snmp");
        result.set_metric(keys::CPU_PERCENT, 12.5);
        result.set_metric(keys::SYSTEM_NAME, "edge-1");
        result.pppoe_sessions.push(PppoeSession {
            session_id: "*1".to_string(),
            username: "alice".to_string(),
            caller_id: None,
            address: None,
            uptime_seconds: None,
        });
        result.dhcp_leases.push(DhcpLease {
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            ip_address: "10.0.0.5".to_string(),
            hostname: None,
            active: true,
        });

        assert_eq!(result.metrics_count(), 4);
        let kinds: Vec<_> = result.session_batches().iter().map(|b| b.kind()).collect();
        assert_eq!(kinds, vec!["pppoe", "dhcp"]);
    }

    #[test]
    fn test_succeed_clears_error_and_stamps_completion() {
        let mut result = PollResult::start(&device(), "snmp");
        result.error = Some("stale".to_string());
        result.succeed();

        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.completed_at >= result.started_at);
    }

    #[test]
    fn test_metric_value_conversions() {
        assert_eq!(MetricValue::from(3u32).as_i64(), Some(3));
        assert_eq!(MetricValue::from(1.5).as_f64(), Some(1.5));
        assert_eq!(MetricValue::from("x").as_str(), Some("x"));
        assert_eq!(MetricValue::from(true).as_f64(), None);
        assert_eq!(MetricValue::from(u64::MAX), MetricValue::Integer(i64::MAX));
    }

    #[test]
    fn test_metric_value_json_is_untagged() {
        let mut result = PollResult::start(&device(), "snmp");
        result.set_metric("a", 1i64);
        result.set_metric("b", "text");
        let json = serde_json::to_value(&result.metrics).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": "text"}));
    }
}
