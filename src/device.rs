//! Device descriptors, capability sets and role assignments
//!
//! A [`Device`] is what the scheduler hands to the worker pool. It is read-only
//! from the polling engine's point of view, except for `last_polled_at`, which
//! only the result processor advances (through the repository).
//!
//! ## Capabilities
//!
//! Each device carries at most one capability entry per connection method. This
//! is enforced structurally: [`CapabilitySet`] has one `Option` per method.
//! Credentials are stored as [`SecretString`] and are redacted from `Debug`
//! output, so descriptors can be logged freely.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known role codes
pub mod roles {
    pub const CORE_ROUTER: &str = "core_router";
    pub const EDGE_ROUTER: &str = "edge_router";
    pub const BORDER_ROUTER: &str = "border_router";
    pub const ACCESS_ROUTER: &str = "access_router";
    pub const NAT_GATEWAY: &str = "nat_gateway";
    pub const PPPOE_SERVER: &str = "pppoe_server";
    pub const DHCP_SERVER: &str = "dhcp_server";
    pub const VPN_GATEWAY: &str = "vpn_gateway";
    pub const LOAD_BALANCER: &str = "load_balancer";
    pub const BANDWIDTH_SHAPER: &str = "bandwidth_shaper";
    pub const ACCESS_CONTROLLER: &str = "access_controller";
    pub const FIREWALL: &str = "firewall";

    /// Roles whose adapters must collect session/lease tables
    pub fn is_session_tracking(code: &str) -> bool {
        matches!(code, PPPOE_SERVER | NAT_GATEWAY | DHCP_SERVER)
    }

    /// Extra metric types a role asks adapters to attempt
    pub fn metric_types(code: &str) -> &'static [&'static str] {
        match code {
            PPPOE_SERVER => &["pppoe_sessions", "pppoe_throughput", "authentication_failures"],
            NAT_GATEWAY => &["nat_sessions", "nat_pool_utilization", "port_exhaustion"],
            DHCP_SERVER => &["dhcp_leases", "dhcp_pool_utilization", "lease_conflicts"],
            VPN_GATEWAY => &["vpn_tunnels", "vpn_throughput", "tunnel_failures"],
            LOAD_BALANCER => &["backend_health", "connection_distribution", "session_persistence"],
            BANDWIDTH_SHAPER => &["queue_depth", "dropped_packets", "shaped_flows"],
            FIREWALL => &["blocked_connections", "rule_hits", "threat_detections"],
            _ => &[],
        }
    }
}

/// Metric types every device is polled for, regardless of roles
pub const BASE_METRIC_TYPES: [&str; 3] = ["interface_metrics", "cpu_usage", "memory_usage"];

/// Operational status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Active => write!(f, "active"),
            DeviceStatus::Inactive => write!(f, "inactive"),
            DeviceStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

/// A managed router as seen by the polling engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub management_ip: IpAddr,
    pub vendor: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default = "default_polling_enabled")]
    pub polling_enabled: bool,
    #[serde(default = "crate::util::get_default_interval")]
    pub polling_interval_secs: u32,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,

    /// Loaded by the capability/role loader before the device is enqueued
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,

    #[serde(default)]
    pub roles: Vec<RoleAssignment>,
}

fn default_polling_enabled() -> bool {
    true
}

impl Device {
    /// Whether the device must be polled at `now`
    ///
    /// Due means: polling enabled, active, and either never polled or the
    /// polling interval has fully elapsed since the last successful poll.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.polling_enabled || self.status != DeviceStatus::Active {
            return false;
        }

        match self.last_polled_at {
            None => true,
            Some(last) => last + self.polling_interval() < now,
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::seconds(i64::from(self.polling_interval_secs))
    }

    /// The primary role: the one flagged `is_primary`, else the lowest priority value
    pub fn primary_role(&self) -> Option<&RoleAssignment> {
        self.roles
            .iter()
            .find(|role| role.is_primary)
            .or_else(|| self.roles.iter().min_by_key(|role| role.priority))
    }

    pub fn has_role(&self, code: &str) -> bool {
        self.roles.iter().any(|role| role.code == code)
    }

    pub fn role_codes(&self) -> Vec<&str> {
        self.roles.iter().map(|role| role.code.as_str()).collect()
    }

    pub fn requires_session_tracking(&self) -> bool {
        self.roles
            .iter()
            .any(|role| roles::is_session_tracking(&role.code))
    }

    /// Base metric types plus whatever the device's roles ask for, sorted and deduplicated
    pub fn metric_types_to_collect(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = BASE_METRIC_TYPES.to_vec();
        for role in &self.roles {
            types.extend_from_slice(roles::metric_types(&role.code));
        }
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Ordered list of connection methods to try, see [`CapabilitySet::method_order`]
    pub fn method_order(&self) -> Vec<String> {
        self.capabilities
            .as_ref()
            .map(CapabilitySet::method_order)
            .unwrap_or_default()
    }
}

/// A connection method a capability entry can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMethod {
    Snmp,
    Api,
    Ssh,
}

impl ConnectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMethod::Snmp => "snmp",
            ConnectionMethod::Api => "api",
            ConnectionMethod::Ssh => "ssh",
        }
    }
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All configured connection methods of one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub snmp: Option<SnmpCapability>,

    #[serde(default)]
    pub api: Option<ApiCapability>,

    #[serde(default)]
    pub ssh: Option<SshCapability>,

    /// Method (or adapter name) to try first when no fallback order is given
    #[serde(default)]
    pub preferred_method: Option<String>,

    /// Explicit order in which methods/adapters are tried
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

impl CapabilitySet {
    /// Methods whose capability entry is present and enabled, in fixed order
    pub fn enabled_methods(&self) -> Vec<ConnectionMethod> {
        let mut methods = Vec::new();
        if self.snmp.as_ref().is_some_and(|c| c.enabled) {
            methods.push(ConnectionMethod::Snmp);
        }
        if self.api.as_ref().is_some_and(|c| c.enabled) {
            methods.push(ConnectionMethod::Api);
        }
        if self.ssh.as_ref().is_some_and(|c| c.enabled) {
            methods.push(ConnectionMethod::Ssh);
        }
        methods
    }

    pub fn is_enabled(&self, method: ConnectionMethod) -> bool {
        self.enabled_methods().contains(&method)
    }

    /// Order in which the registry should try methods for this device
    ///
    /// An explicit fallback order wins. Otherwise the preferred method goes
    /// first, followed by the remaining enabled methods. Entries are returned
    /// verbatim: the registry matches them against adapter names and methods
    /// and ignores anything it cannot handle.
    pub fn method_order(&self) -> Vec<String> {
        if !self.fallback_order.is_empty() {
            return self.fallback_order.clone();
        }

        let mut order = Vec::new();
        if let Some(preferred) = self.preferred_method.as_deref().filter(|p| !p.is_empty()) {
            order.push(preferred.to_string());
        }

        for method in self.enabled_methods() {
            if !order.iter().any(|entry| entry == method.as_str()) {
                order.push(method.as_str().to_string());
            }
        }

        order
    }
}

/// SNMP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2c")]
    V2c,
    #[serde(rename = "v3")]
    V3,
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpVersion::V1 => write!(f, "v1"),
            SnmpVersion::V2c => write!(f, "v2c"),
            SnmpVersion::V3 => write!(f, "v3"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SnmpCapability {
    pub enabled: bool,
    pub version: SnmpVersion,

    #[serde(default, serialize_with = "secret::serialize_opt")]
    pub community: Option<SecretString>,

    #[serde(default = "default_snmp_port")]
    pub port: u16,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub v3: Option<SnmpV3Credentials>,
}

fn default_snmp_port() -> u16 {
    161
}

impl fmt::Debug for SnmpCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnmpCapability")
            .field("enabled", &self.enabled)
            .field("version", &self.version)
            .field("community", &self.community.as_ref().map(|_| "[REDACTED]"))
            .field("port", &self.port)
            .field("timeout_secs", &self.timeout_secs)
            .field("retries", &self.retries)
            .field("v3", &self.v3)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SnmpV3Credentials {
    pub username: String,

    /// MD5, SHA, SHA-224, SHA-256, SHA-384, SHA-512
    #[serde(default)]
    pub auth_protocol: Option<String>,

    #[serde(default, serialize_with = "secret::serialize_opt")]
    pub auth_password: Option<SecretString>,

    /// DES, AES, AES-192, AES-256
    #[serde(default)]
    pub priv_protocol: Option<String>,

    #[serde(default, serialize_with = "secret::serialize_opt")]
    pub priv_password: Option<SecretString>,
}

impl fmt::Debug for SnmpV3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnmpV3Credentials")
            .field("username", &self.username)
            .field("auth_protocol", &self.auth_protocol)
            .field("priv_protocol", &self.priv_protocol)
            .finish_non_exhaustive()
    }
}

/// Vendor API access (RouterOS, RESTCONF, ...)
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiCapability {
    pub enabled: bool,

    /// Vendor API flavor, e.g. "mikrotik"
    pub kind: String,

    /// Base URL override; derived from the management address when absent
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    pub username: String,

    #[serde(serialize_with = "secret::serialize")]
    pub password: SecretString,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default = "default_verify_cert")]
    pub verify_cert: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_verify_cert() -> bool {
    true
}

impl fmt::Debug for ApiCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCapability")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .field("verify_cert", &self.verify_cert)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SshCapability {
    pub enabled: bool,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    #[serde(default, serialize_with = "secret::serialize_opt")]
    pub password: Option<SecretString>,

    #[serde(default, serialize_with = "secret::serialize_opt")]
    pub private_key: Option<SecretString>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for SshCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCapability")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

/// A logical role a device plays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Role code, see [`roles`]
    pub code: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Lower is more important
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub is_primary: bool,
}

/// Serializers that write secrets out verbatim
///
/// Only used when capability sets are persisted by a storage backend.
mod secret {
    use secrecy::{ExposeSecret, SecretString};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.expose_secret())
    }

    pub fn serialize_opt<S: Serializer>(
        value: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(secret) => serializer.serialize_some(secret.expose_secret()),
            None => serializer.serialize_none(),
        }
    }
}
