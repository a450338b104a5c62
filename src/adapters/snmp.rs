//! SNMP adapter
//!
//! Reads the standard MIB-II and HOST-RESOURCES objects every router agent
//! exposes:
//!
//! - `sysDescr`, `sysName`, `sysUpTime`, `ifNumber` (system group)
//! - `hrProcessorLoad` averaged over all processors (CPU)
//! - the `hrStorageRam` row of `hrStorageTable` (memory)
//! - `ifTable` descriptions, status and octet counters (interfaces)
//!
//! `sysDescr` is fetched first. If the agent does not answer it the poll is
//! reported as a session failure; anything failing after that only degrades
//! the result.
//!
//! v1 and v2c authenticate with a community string. v3 (USM) requires the
//! `snmp-v3` feature, otherwise it is rejected as an unsupported version.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use snmp2::{AsyncSession, Oid, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{AdapterConfig, PollerAdapter, guarded};
use crate::device::{ConnectionMethod, Device, SnmpCapability, SnmpVersion};
use crate::error::{PollError, SessionFailure};
use crate::poll_result::{InterfaceStatus, MetricValue, PollResult, keys};

const SYS_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
const SYS_UPTIME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
const SYS_NAME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
const IF_NUMBER: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 1, 0];

const IF_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 2];
const IF_ADMIN_STATUS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 7];
const IF_OPER_STATUS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 8];
const IF_IN_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 10];
const IF_OUT_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 16];

const HR_PROCESSOR_LOAD: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 3, 3, 1, 2];
const HR_STORAGE_TYPE: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 2];
const HR_STORAGE_UNITS: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 4];
const HR_STORAGE_SIZE: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 5];
const HR_STORAGE_USED: &[u64] = &[1, 3, 6, 1, 2, 1, 25, 2, 3, 1, 6];
const HR_STORAGE_RAM: &str = "1.3.6.1.2.1.25.2.1.2";

/// Upper bound on rows read from a single table walk
const MAX_WALK_ROWS: usize = 512;
const WALK_REPETITIONS: u32 = 16;

const SUPPORTED_METRICS: &[&str] = &[
    keys::SYSTEM_DESCRIPTION,
    keys::SYSTEM_NAME,
    keys::UPTIME_SECONDS,
    keys::INTERFACE_COUNT,
    keys::CPU_PERCENT,
    keys::MEMORY_PERCENT,
    keys::MEMORY_TOTAL_MB,
    keys::MEMORY_USED_MB,
    keys::MEMORY_FREE_MB,
    "interface_metrics",
];

pub struct SnmpAdapter {
    config: AdapterConfig,
}

impl SnmpAdapter {
    pub const NAME: &'static str = "snmp";

    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn capability<'a>(&self, device: &'a Device) -> Option<&'a SnmpCapability> {
        device
            .capabilities
            .as_ref()?
            .snmp
            .as_ref()
            .filter(|cap| cap.enabled)
    }

    fn require_capability<'a>(&self, device: &'a Device) -> Result<&'a SnmpCapability, PollError> {
        self.capability(device)
            .ok_or_else(|| PollError::NotConfigured {
                adapter: Self::NAME.to_string(),
                reason: "snmp capability missing or disabled".to_string(),
            })
    }

    async fn collect_system(
        &self,
        cancel: &CancellationToken,
        session: &mut SnmpSession,
        result: &mut PollResult,
    ) {
        match session.get(cancel, SYS_NAME).await {
            Ok(Some(name)) => result.set_metric(keys::SYSTEM_NAME, name),
            Ok(None) => {}
            Err(e) => partial_failure(result, "sysName", &e),
        }

        match session.get(cancel, SYS_UPTIME).await {
            // timeticks are hundredths of a second
            Ok(Some(ticks)) => {
                if let Some(ticks) = ticks.as_i64() {
                    result.set_metric(keys::UPTIME_SECONDS, ticks / 100);
                }
            }
            Ok(None) => {}
            Err(e) => partial_failure(result, "sysUpTime", &e),
        }

        match session.get(cancel, IF_NUMBER).await {
            Ok(Some(count)) => result.set_metric(keys::INTERFACE_COUNT, count),
            Ok(None) => {}
            Err(e) => partial_failure(result, "ifNumber", &e),
        }
    }

    async fn collect_cpu(
        &self,
        cancel: &CancellationToken,
        session: &mut SnmpSession,
        result: &mut PollResult,
    ) {
        match session.walk(cancel, HR_PROCESSOR_LOAD).await {
            Ok(rows) => {
                let loads: Vec<f64> = rows.iter().filter_map(|(_, v)| v.as_f64()).collect();
                if !loads.is_empty() {
                    let average = loads.iter().sum::<f64>() / loads.len() as f64;
                    result.set_metric(keys::CPU_PERCENT, average);
                }
            }
            Err(e) => partial_failure(result, "hrProcessorLoad", &e),
        }
    }

    async fn collect_memory(
        &self,
        cancel: &CancellationToken,
        session: &mut SnmpSession,
        result: &mut PollResult,
    ) {
        let types = match session.walk(cancel, HR_STORAGE_TYPE).await {
            Ok(types) => types,
            Err(e) => {
                partial_failure(result, "hrStorageType", &e);
                return;
            }
        };

        let Some(index) = types
            .iter()
            .find(|(_, kind)| kind.as_str() == Some(HR_STORAGE_RAM))
            .map(|(index, _)| *index)
        else {
            trace!("agent exposes no hrStorageRam row");
            return;
        };

        let units = session.get_cell(cancel, HR_STORAGE_UNITS, index).await;
        let size = session.get_cell(cancel, HR_STORAGE_SIZE, index).await;
        let used = session.get_cell(cancel, HR_STORAGE_USED, index).await;

        match (units, size, used) {
            (Ok(Some(units)), Ok(Some(size)), Ok(Some(used))) if size > 0 => {
                let total_mb = size * units / (1024 * 1024);
                let used_mb = used * units / (1024 * 1024);
                result.set_metric(keys::MEMORY_TOTAL_MB, total_mb);
                result.set_metric(keys::MEMORY_USED_MB, used_mb);
                result.set_metric(keys::MEMORY_FREE_MB, total_mb - used_mb);
                result.set_metric(keys::MEMORY_PERCENT, used as f64 / size as f64 * 100.0);
            }
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                partial_failure(result, "hrStorageRam", &e)
            }
            _ => trace!("incomplete hrStorageRam row"),
        }
    }

    async fn collect_interfaces(
        &self,
        cancel: &CancellationToken,
        session: &mut SnmpSession,
        result: &mut PollResult,
    ) {
        let descriptions = match session.walk(cancel, IF_DESCR).await {
            Ok(rows) => rows,
            Err(e) => {
                partial_failure(result, "ifDescr", &e);
                return;
            }
        };

        let mut interfaces: Vec<InterfaceStatus> = descriptions
            .into_iter()
            .map(|(index, descr)| InterfaceStatus {
                name: descr.to_string(),
                index: u32::try_from(index).ok(),
                oper_up: false,
                admin_up: false,
                rx_bytes: 0,
                tx_bytes: 0,
                rx_packets: 0,
                tx_packets: 0,
            })
            .collect();

        let columns: [(&[u64], &str, fn(&mut InterfaceStatus, i64)); 4] = [
            (IF_ADMIN_STATUS, "ifAdminStatus", |iface, v| iface.admin_up = v == 1),
            (IF_OPER_STATUS, "ifOperStatus", |iface, v| iface.oper_up = v == 1),
            (IF_IN_OCTETS, "ifInOctets", |iface, v| iface.rx_bytes = v.max(0) as u64),
            (IF_OUT_OCTETS, "ifOutOctets", |iface, v| iface.tx_bytes = v.max(0) as u64),
        ];

        for (column, label, apply) in columns {
            let rows = match session.walk(cancel, column).await {
                Ok(rows) => rows,
                Err(e) => {
                    partial_failure(result, label, &e);
                    continue;
                }
            };

            for (index, value) in rows {
                let Some(iface) = interfaces
                    .iter_mut()
                    .find(|iface| iface.index.map(u64::from) == Some(index))
                else {
                    continue;
                };
                apply(iface, value.as_i64().unwrap_or_default());
            }
        }

        if !result.metrics.contains_key(keys::INTERFACE_COUNT) {
            result.set_metric(keys::INTERFACE_COUNT, interfaces.len());
        }
        result.interfaces = interfaces;
    }
}

#[async_trait]
impl PollerAdapter for SnmpAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::Snmp
    }

    fn can_handle(&self, device: &Device) -> bool {
        self.capability(device).is_some_and(|cap| match cap.version {
            SnmpVersion::V1 | SnmpVersion::V2c => cap
                .community
                .as_ref()
                .is_some_and(|c| !c.expose_secret().is_empty()),
            SnmpVersion::V3 => cap.v3.as_ref().is_some_and(|v3| !v3.username.is_empty()),
        })
    }

    #[instrument(skip_all, fields(device = %device.name))]
    async fn poll(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<PollResult, SessionFailure> {
        let mut result = PollResult::start(device, Self::NAME);

        let cap = match self.require_capability(device) {
            Ok(cap) => cap,
            Err(e) => return Err(SessionFailure::new(e, result)),
        };

        let mut session = match SnmpSession::open(cancel, device, cap, &self.config).await {
            Ok(session) => session,
            Err(e) => return Err(SessionFailure::new(e, result)),
        };

        match session.get(cancel, SYS_DESCR).await {
            Ok(Some(descr)) => result.set_metric(keys::SYSTEM_DESCRIPTION, descr),
            Ok(None) => debug!("agent returned no sysDescr"),
            Err(e) => return Err(SessionFailure::new(e, result)),
        }

        self.collect_system(cancel, &mut session, &mut result).await;
        self.collect_cpu(cancel, &mut session, &mut result).await;
        self.collect_memory(cancel, &mut session, &mut result).await;
        self.collect_interfaces(cancel, &mut session, &mut result).await;

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
        let cap = self.require_capability(device)?;
        let mut session = SnmpSession::open(cancel, device, cap, &self.config).await?;
        session.get(cancel, SYS_DESCR).await?;
        Ok(())
    }

    fn supported_metrics(&self) -> &[&'static str] {
        SUPPORTED_METRICS
    }
}

fn partial_failure(result: &PollResult, what: &str, error: &PollError) {
    warn!(
        device_id = %result.device_id,
        "snmp {what} collection failed, continuing: {error}"
    );
}

/// One open SNMP session with its transport settings
struct SnmpSession {
    session: AsyncSession,
    target: SocketAddr,
    bulk: bool,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
}

impl SnmpSession {
    async fn open(
        cancel: &CancellationToken,
        device: &Device,
        cap: &SnmpCapability,
        config: &AdapterConfig,
    ) -> Result<Self, PollError> {
        let target = SocketAddr::new(device.management_ip, cap.port);
        let timeout = cap
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.timeout);

        let session = match cap.version {
            SnmpVersion::V1 | SnmpVersion::V2c => {
                let community = cap
                    .community
                    .as_ref()
                    .map(|c| c.expose_secret().as_bytes().to_vec())
                    .ok_or_else(|| PollError::NotConfigured {
                        adapter: SnmpAdapter::NAME.to_string(),
                        reason: "community string missing".to_string(),
                    })?;

                guarded(cancel, timeout, "snmp session", async {
                    if cap.version == SnmpVersion::V1 {
                        AsyncSession::new_v1(target, &community, 0)
                            .await
                            .map_err(|e| connect_failed(target, e))
                    } else {
                        AsyncSession::new_v2c(target, &community, 0)
                            .await
                            .map_err(|e| connect_failed(target, e))
                    }
                })
                .await?
            }

            #[cfg(feature = "snmp-v3")]
            SnmpVersion::V3 => {
                let creds = cap.v3.as_ref().ok_or_else(|| PollError::NotConfigured {
                    adapter: SnmpAdapter::NAME.to_string(),
                    reason: "v3 credentials missing".to_string(),
                })?;
                let security = usm::security(creds)?;

                guarded(cancel, timeout, "snmp session", async {
                    let mut session = AsyncSession::new_v3(target, 0, security)
                        .await
                        .map_err(|e| connect_failed(target, e))?;
                    session
                        .init()
                        .await
                        .map_err(|e| PollError::Auth {
                            target: format!("{target} ({e})"),
                        })?;
                    Ok(session)
                })
                .await?
            }

            #[cfg(not(feature = "snmp-v3"))]
            SnmpVersion::V3 => {
                return Err(PollError::UnsupportedVersion {
                    protocol: "snmp".to_string(),
                    version: SnmpVersion::V3.to_string(),
                });
            }
        };

        trace!("opened snmp {} session to {target}", cap.version);

        Ok(Self {
            session,
            target,
            bulk: cap.version != SnmpVersion::V1,
            timeout,
            retries: cap.retries.unwrap_or(config.retries),
            retry_delay: config.retry_delay,
        })
    }

    /// GET a single scalar, retrying timed out requests up to `retries` times
    async fn get(
        &mut self,
        cancel: &CancellationToken,
        parts: &[u64],
    ) -> Result<Option<MetricValue>, PollError> {
        let oid = build_oid(parts)?;
        let target = self.target;
        let mut attempt = 0;

        loop {
            let session = &mut self.session;
            let outcome = guarded(cancel, self.timeout, "snmp get", async {
                let pdu = session
                    .get(&oid)
                    .await
                    .map_err(|e| PollError::Protocol(format!("get from {target}: {e}")))?;
                Ok(pdu
                    .varbinds
                    .into_iter()
                    .next()
                    .and_then(|(_, value)| to_metric(&value)))
            })
            .await;

            match outcome {
                Err(PollError::Timeout { .. }) if attempt < self.retries => {
                    attempt += 1;
                    trace!("snmp get timed out, retry {attempt}/{}", self.retries);
                    self.backoff(cancel).await?;
                }
                other => return other,
            }
        }
    }

    /// GET one cell of a table column
    async fn get_cell(
        &mut self,
        cancel: &CancellationToken,
        column: &[u64],
        index: u64,
    ) -> Result<Option<i64>, PollError> {
        let mut oid = column.to_vec();
        oid.push(index);
        Ok(self.get(cancel, &oid).await?.and_then(|v| v.as_i64()))
    }

    /// Walk one table column, returning (row index, value) pairs
    async fn walk(
        &mut self,
        cancel: &CancellationToken,
        root_parts: &[u64],
    ) -> Result<Vec<(u64, MetricValue)>, PollError> {
        let root = build_oid(root_parts)?;
        let mut current = root.to_owned();
        let mut rows = Vec::new();
        let target = self.target;
        let bulk = self.bulk;

        loop {
            let session = &mut self.session;
            let root = &root;
            let start = &current;
            let page = guarded(cancel, self.timeout, "snmp walk", async move {
                let response = if bulk {
                    session.getbulk(&[start], 0, WALK_REPETITIONS).await
                } else {
                    session.getnext(start).await
                };
                let pdu =
                    response.map_err(|e| PollError::Protocol(format!("walk on {target}: {e}")))?;

                let mut page = WalkPage::default();
                for (oid, value) in pdu.varbinds {
                    if !oid.starts_with(root) || matches!(value, Value::EndOfMibView) {
                        page.done = true;
                        break;
                    }
                    let index = oid
                        .to_id_string()
                        .rsplit('.')
                        .next()
                        .and_then(|arc| arc.parse::<u64>().ok());
                    if let (Some(index), Some(value)) = (index, to_metric(&value)) {
                        page.rows.push((index, value));
                    }
                    page.last = Some(oid.to_owned());
                }
                Ok(page)
            })
            .await?;

            rows.extend(page.rows);

            match page.last {
                Some(last) if !page.done && last != current && rows.len() < MAX_WALK_ROWS => {
                    current = last;
                }
                _ => break,
            }
        }

        rows.truncate(MAX_WALK_ROWS);
        Ok(rows)
    }

    async fn backoff(&self, cancel: &CancellationToken) -> Result<(), PollError> {
        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(PollError::Cancelled),
            () = tokio::time::sleep(self.retry_delay) => Ok(()),
        }
    }
}

fn connect_failed(target: SocketAddr, error: impl std::fmt::Display) -> PollError {
    PollError::Connect {
        target: target.to_string(),
        reason: error.to_string(),
    }
}

#[derive(Default)]
struct WalkPage {
    rows: Vec<(u64, MetricValue)>,
    last: Option<Oid<'static>>,
    done: bool,
}

fn build_oid(parts: &[u64]) -> Result<Oid<'static>, PollError> {
    Oid::from(parts).map_err(|e| PollError::Protocol(format!("invalid OID {parts:?}: {e:?}")))
}

/// Convert a varbind value into an owned metric value
fn to_metric(value: &Value<'_>) -> Option<MetricValue> {
    match value {
        Value::Boolean(b) => Some(MetricValue::Bool(*b)),
        Value::Integer(i) => Some(MetricValue::Integer(*i)),
        Value::OctetString(bytes) => Some(MetricValue::Text(
            String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string(),
        )),
        Value::ObjectIdentifier(oid) => Some(MetricValue::Text(oid.to_id_string())),
        Value::IpAddress(octets) => Some(MetricValue::Text(
            std::net::Ipv4Addr::from(*octets).to_string(),
        )),
        Value::Counter32(v) | Value::Unsigned32(v) | Value::Timeticks(v) => {
            Some(MetricValue::from(*v))
        }
        Value::Counter64(v) => Some(MetricValue::from(*v)),
        _ => None,
    }
}

#[cfg(feature = "snmp-v3")]
mod usm {
    use secrecy::ExposeSecret;
    use snmp2::v3::{Auth, AuthProtocol, Cipher, Security};

    use crate::device::SnmpV3Credentials;
    use crate::error::PollError;

    fn unsupported(what: &str, value: &str) -> PollError {
        PollError::UnsupportedVersion {
            protocol: format!("snmp v3 {what}"),
            version: value.to_string(),
        }
    }

    fn auth_protocol(name: &str) -> Result<AuthProtocol, PollError> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Ok(AuthProtocol::Md5),
            "SHA" | "SHA1" | "SHA-1" => Ok(AuthProtocol::Sha1),
            "SHA224" | "SHA-224" => Ok(AuthProtocol::Sha224),
            "SHA256" | "SHA-256" => Ok(AuthProtocol::Sha256),
            "SHA384" | "SHA-384" => Ok(AuthProtocol::Sha384),
            "SHA512" | "SHA-512" => Ok(AuthProtocol::Sha512),
            other => Err(unsupported("auth protocol", other)),
        }
    }

    fn cipher(name: &str) -> Result<Cipher, PollError> {
        match name.to_ascii_uppercase().as_str() {
            "DES" => Ok(Cipher::Des),
            "AES" | "AES128" | "AES-128" => Ok(Cipher::Aes128),
            "AES192" | "AES-192" => Ok(Cipher::Aes192),
            "AES256" | "AES-256" => Ok(Cipher::Aes256),
            other => Err(unsupported("privacy protocol", other)),
        }
    }

    pub(super) fn security(creds: &SnmpV3Credentials) -> Result<Security, PollError> {
        let auth_password = creds
            .auth_password
            .as_ref()
            .map(|p| p.expose_secret().as_bytes().to_vec())
            .unwrap_or_default();

        let mut security = Security::new(creds.username.as_bytes(), &auth_password);
        if let Some(protocol) = creds.auth_protocol.as_deref() {
            security = security.with_auth_protocol(auth_protocol(protocol)?);
        }

        let auth = match (creds.priv_protocol.as_deref(), creds.priv_password.as_ref()) {
            (Some(protocol), Some(password)) => Auth::AuthPriv {
                cipher: cipher(protocol)?,
                privacy_password: password.expose_secret().as_bytes().to_vec(),
            },
            _ if creds.auth_password.is_some() => Auth::AuthNoPriv,
            _ => Auth::NoAuthNoPriv,
        };

        Ok(security.with_auth(auth))
    }
}
