//! MikroTik RouterOS adapter
//!
//! Talks to the RouterOS v7 REST API (`/rest/...`) with HTTP basic auth. The
//! API returns every value as a JSON string, so all numbers and booleans are
//! parsed leniently.
//!
//! ## Collected data
//!
//! ```text
//! /rest/system/resource          -> cpu, memory, uptime, board, version (always)
//! /rest/interface                -> interface statuses (always)
//! /rest/ppp/active               -> PPPoE sessions   (pppoe_server role)
//! /rest/ip/firewall/connection   -> NAT sessions     (nat_gateway role)
//! /rest/ip/dhcp-server/lease     -> DHCP leases      (dhcp_server role)
//! ```
//!
//! `/rest/system/resource` doubles as the session check: if it cannot be
//! fetched, the poll is a session failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{AdapterConfig, PollerAdapter, guarded};
use crate::device::{ApiCapability, ConnectionMethod, Device, roles};
use crate::error::{PollError, SessionFailure};
use crate::poll_result::{
    DhcpLease, InterfaceStatus, NatSession, PollResult, PppoeSession, keys,
};

const SYSTEM_RESOURCE: &str = "/rest/system/resource";
const INTERFACES: &str = "/rest/interface";
const PPP_ACTIVE: &str = "/rest/ppp/active";
const FIREWALL_CONNECTIONS: &str = "/rest/ip/firewall/connection";
const DHCP_LEASES: &str = "/rest/ip/dhcp-server/lease";

/// Connection tracking tables can be huge; only this many entries are kept
const MAX_NAT_SESSIONS: usize = 5000;

const SUPPORTED_METRICS: &[&str] = &[
    keys::CPU_PERCENT,
    keys::MEMORY_PERCENT,
    keys::MEMORY_TOTAL_MB,
    keys::MEMORY_USED_MB,
    keys::MEMORY_FREE_MB,
    keys::UPTIME_SECONDS,
    keys::BOARD_NAME,
    keys::FIRMWARE_VERSION,
    keys::INTERFACE_COUNT,
    "interface_metrics",
    "pppoe_sessions",
    "nat_sessions",
    "dhcp_leases",
];

pub struct MikrotikAdapter {
    config: AdapterConfig,

    /// Client that validates server certificates
    client: reqwest::Client,

    /// Client for devices with `verify_cert = false` (self-signed certificates)
    insecure_client: reqwest::Client,
}

impl MikrotikAdapter {
    pub const NAME: &'static str = "mikrotik_api";
    pub const KIND: &'static str = "mikrotik";

    pub fn new(config: AdapterConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let insecure_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            config,
            client,
            insecure_client,
        })
    }

    fn capability<'a>(&self, device: &'a Device) -> Option<&'a ApiCapability> {
        device
            .capabilities
            .as_ref()?
            .api
            .as_ref()
            .filter(|cap| cap.enabled && cap.kind.eq_ignore_ascii_case(Self::KIND))
    }

    fn session<'a>(&'a self, device: &'a Device) -> Result<RestSession<'a>, PollError> {
        let cap = self.capability(device).ok_or_else(|| PollError::NotConfigured {
            adapter: Self::NAME.to_string(),
            reason: "mikrotik api capability missing or disabled".to_string(),
        })?;

        let base_url = match &cap.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let scheme = if cap.use_tls { "https" } else { "http" };
                let port = cap.port.unwrap_or(if cap.use_tls { 443 } else { 80 });
                match device.management_ip {
                    std::net::IpAddr::V4(ip) => format!("{scheme}://{ip}:{port}"),
                    std::net::IpAddr::V6(ip) => format!("{scheme}://[{ip}]:{port}"),
                }
            }
        };

        Ok(RestSession {
            client: if cap.verify_cert {
                &self.client
            } else {
                &self.insecure_client
            },
            cap,
            base_url,
            timeout: cap
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.config.timeout),
        })
    }
}

#[async_trait]
impl PollerAdapter for MikrotikAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::Api
    }

    fn can_handle(&self, device: &Device) -> bool {
        self.capability(device)
            .is_some_and(|cap| !cap.username.is_empty())
    }

    #[instrument(skip_all, fields(device = %device.name))]
    async fn poll(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<PollResult, SessionFailure> {
        let mut result = PollResult::start(device, Self::NAME);

        let session = match self.session(device) {
            Ok(session) => session,
            Err(e) => return Err(SessionFailure::new(e, result)),
        };

        let resource: SystemResource = match session.get(cancel, SYSTEM_RESOURCE).await {
            Ok(resource) => resource,
            Err(e) => return Err(SessionFailure::new(e, result)),
        };
        resource.apply(&mut result);

        match session.get::<Vec<Value>>(cancel, INTERFACES).await {
            Ok(entries) => {
                result.interfaces = entries.iter().filter_map(parse_interface).collect();
                result.set_metric(keys::INTERFACE_COUNT, result.interfaces.len());
            }
            Err(e) => partial_failure(&result, "interfaces", &e),
        }

        if device.has_role(roles::PPPOE_SERVER) {
            match session.get::<Vec<Value>>(cancel, PPP_ACTIVE).await {
                Ok(entries) => {
                    result.pppoe_sessions = entries.iter().filter_map(parse_ppp_session).collect();
                    result.set_metric(keys::PPPOE_ACTIVE_SESSIONS, result.pppoe_sessions.len());
                }
                Err(e) => partial_failure(&result, "ppp sessions", &e),
            }
        }

        if device.has_role(roles::NAT_GATEWAY) {
            match session.get::<Vec<Value>>(cancel, FIREWALL_CONNECTIONS).await {
                Ok(entries) => {
                    result.set_metric(keys::NAT_TOTAL_SESSIONS, entries.len());
                    result.nat_sessions = entries
                        .iter()
                        .filter_map(parse_nat_session)
                        .take(MAX_NAT_SESSIONS)
                        .collect();
                }
                Err(e) => partial_failure(&result, "connection tracking", &e),
            }
        }

        if device.has_role(roles::DHCP_SERVER) {
            match session.get::<Vec<Value>>(cancel, DHCP_LEASES).await {
                Ok(entries) => {
                    result.dhcp_leases = entries.iter().filter_map(parse_dhcp_lease).collect();
                    result.set_metric(keys::DHCP_LEASE_COUNT, result.dhcp_leases.len());
                }
                Err(e) => partial_failure(&result, "dhcp leases", &e),
            }
        }

        if cancel.is_cancelled() {
            result.fail(PollError::Cancelled.to_string());
            return Ok(result);
        }

        result.succeed();
        debug!(
            "collected {} data points in {}ms",
            result.metrics_count(),
            result.response_time_ms
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(device = %device.name))]
    async fn health_check(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<(), PollError> {
        let session = self.session(device)?;
        session.get::<Value>(cancel, SYSTEM_RESOURCE).await?;
        Ok(())
    }

    fn supported_metrics(&self) -> &[&'static str] {
        SUPPORTED_METRICS
    }
}

fn partial_failure(result: &PollResult, what: &str, error: &PollError) {
    warn!(
        device_id = %result.device_id,
        "mikrotik {what} collection failed, continuing: {error}"
    );
}

/// Per-poll view of one device's REST endpoint
struct RestSession<'a> {
    client: &'a reqwest::Client,
    cap: &'a ApiCapability,
    base_url: String,
    timeout: Duration,
}

impl RestSession<'_> {
    async fn get<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<T, PollError> {
        let url = format!("{}{}", self.base_url, path);
        trace!("requesting {url}");

        guarded(cancel, self.timeout, path, async {
            let response = self
                .client
                .get(&url)
                .basic_auth(&self.cap.username, Some(self.cap.password.expose_secret()))
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| self.transport_error(path, e))?;

            match response.status() {
                status if status.is_success() => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(PollError::Auth {
                        target: self.base_url.clone(),
                    });
                }
                status => {
                    return Err(PollError::Protocol(format!("{path} returned HTTP {status}")));
                }
            }

            response
                .json::<T>()
                .await
                .map_err(|e| PollError::Protocol(format!("invalid {path} payload: {e}")))
        })
        .await
    }

    fn transport_error(&self, path: &str, error: reqwest::Error) -> PollError {
        if error.is_timeout() {
            PollError::Timeout {
                operation: path.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else if error.is_connect() {
            PollError::Connect {
                target: self.base_url.clone(),
                reason: error.to_string(),
            }
        } else {
            PollError::Protocol(format!("{path}: {error}"))
        }
    }
}

/// `/rest/system/resource`
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SystemResource {
    #[serde(default)]
    cpu_load: Option<Value>,
    #[serde(default)]
    total_memory: Option<Value>,
    #[serde(default)]
    free_memory: Option<Value>,
    #[serde(default)]
    uptime: Option<String>,
    #[serde(default)]
    board_name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

impl SystemResource {
    fn apply(&self, result: &mut PollResult) {
        if let Some(cpu) = self.cpu_load.as_ref().and_then(as_f64) {
            result.set_metric(keys::CPU_PERCENT, cpu);
        }

        let total = self.total_memory.as_ref().and_then(as_u64);
        let free = self.free_memory.as_ref().and_then(as_u64);
        if let (Some(total), Some(free)) = (total, free)
            && total > 0
        {
            let used = total.saturating_sub(free);
            result.set_metric(keys::MEMORY_TOTAL_MB, total / (1024 * 1024));
            result.set_metric(keys::MEMORY_FREE_MB, free / (1024 * 1024));
            result.set_metric(keys::MEMORY_USED_MB, used / (1024 * 1024));
            result.set_metric(keys::MEMORY_PERCENT, used as f64 / total as f64 * 100.0);
        }

        if let Some(uptime) = self.uptime.as_deref().and_then(parse_uptime) {
            result.set_metric(keys::UPTIME_SECONDS, uptime);
        }
        if let Some(board) = &self.board_name {
            result.set_metric(keys::BOARD_NAME, board.as_str());
        }
        if let Some(version) = &self.version {
            result.set_metric(keys::FIRMWARE_VERSION, version.as_str());
        }
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(entry: &Value, key: &str) -> Option<String> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn flag(entry: &Value, key: &str) -> bool {
    entry.get(key).and_then(as_bool).unwrap_or(false)
}

fn counter(entry: &Value, key: &str) -> u64 {
    entry.get(key).and_then(as_u64).unwrap_or(0)
}

fn parse_interface(entry: &Value) -> Option<InterfaceStatus> {
    Some(InterfaceStatus {
        name: text(entry, "name")?,
        index: None,
        oper_up: flag(entry, "running"),
        admin_up: !flag(entry, "disabled"),
        rx_bytes: counter(entry, "rx-byte"),
        tx_bytes: counter(entry, "tx-byte"),
        rx_packets: counter(entry, "rx-packet"),
        tx_packets: counter(entry, "tx-packet"),
    })
}

fn parse_ppp_session(entry: &Value) -> Option<PppoeSession> {
    Some(PppoeSession {
        session_id: text(entry, ".id")?,
        username: text(entry, "name").unwrap_or_default(),
        caller_id: text(entry, "caller-id"),
        address: text(entry, "address"),
        uptime_seconds: text(entry, "uptime").as_deref().and_then(parse_uptime),
    })
}

fn parse_nat_session(entry: &Value) -> Option<NatSession> {
    Some(NatSession {
        protocol: text(entry, "protocol").unwrap_or_else(|| "unknown".to_string()),
        src_address: text(entry, "src-address")?,
        dst_address: text(entry, "dst-address")?,
        reply_src_address: text(entry, "reply-src-address"),
        state: text(entry, "tcp-state"),
    })
}

fn parse_dhcp_lease(entry: &Value) -> Option<DhcpLease> {
    Some(DhcpLease {
        mac_address: text(entry, "mac-address")?.to_ascii_uppercase(),
        ip_address: text(entry, "address")?,
        hostname: text(entry, "host-name"),
        active: text(entry, "status").as_deref() == Some("bound"),
    })
}

/// Parse a RouterOS duration such as `1w2d3h4m5s` into seconds
///
/// Newer releases may also print `hh:mm:ss` for the sub-day part.
pub fn parse_uptime(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut total = 0u64;
    let mut number = String::new();
    let mut rest = raw;

    while let Some(c) = rest.chars().next() {
        if c.is_ascii_digit() {
            number.push(c);
            rest = &rest[1..];
            continue;
        }

        if c == ':' {
            // remainder is hh:mm:ss with `number` as hours
            let clock = format!("{number}{rest}");
            let parts: Vec<u64> = clock
                .split(':')
                .map(|p| p.parse().ok())
                .collect::<Option<_>>()?;
            let [h, m, s] = parts.as_slice() else {
                return None;
            };
            let clock = h
                .checked_mul(3600)?
                .checked_add(m.checked_mul(60)?)?
                .checked_add(*s)?;
            return total.checked_add(clock);
        }

        let value: u64 = number.parse().ok()?;
        number.clear();
        let (unit, len) = if rest.starts_with("ms") {
            (0, 2)
        } else {
            let unit = match c {
                'w' => 7 * 24 * 3600,
                'd' => 24 * 3600,
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return None,
            };
            (unit, 1)
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
        rest = &rest[len..];
    }

    if !number.is_empty() {
        return None;
    }
    Some(total)
}
