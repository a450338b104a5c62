//! Protocol adapters
//!
//! An adapter knows how to open a session to one device over one protocol and
//! turn what it finds into a [`PollResult`]. Adapters are stateless across
//! polls and never retry on their own; choosing another adapter after a
//! failure is the [`AdapterRegistry`]'s job.
//!
//! ## Adapters
//!
//! - [`SnmpAdapter`] (`snmp`): SNMP v1/v2c, and v3 with the `snmp-v3` feature
//! - [`MikrotikAdapter`] (`mikrotik_api`): RouterOS REST API

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PollerConfig;
use crate::device::{ConnectionMethod, Device};
use crate::error::{PollError, SessionFailure};
use crate::poll_result::PollResult;

pub mod mikrotik;
pub mod registry;
pub mod snmp;

pub use mikrotik::MikrotikAdapter;
pub use registry::AdapterRegistry;
pub use snmp::SnmpAdapter;

/// Uniform contract every protocol adapter satisfies
#[async_trait]
pub trait PollerAdapter: Send + Sync {
    /// Stable identifier, also accepted in a device's fallback order
    fn name(&self) -> &str;

    /// Connection method this adapter serves
    fn method(&self) -> ConnectionMethod;

    /// Whether the device has this adapter's method enabled and minimally
    /// configured. Must not do any I/O.
    fn can_handle(&self, device: &Device) -> bool;

    /// Run the full protocol exchange against `device`
    ///
    /// Failing to establish a session at all is returned as
    /// `Err(SessionFailure)`, whose result carries the same message. Every
    /// other outcome is an `Ok` result, successful or not.
    async fn poll(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<PollResult, SessionFailure>;

    /// Minimal connectivity probe, independent from `poll`
    async fn health_check(&self, cancel: &CancellationToken, device: &Device)
    -> Result<(), PollError>;

    /// Metric types this adapter can produce (advertisement only)
    fn supported_metrics(&self) -> &[&'static str];
}

/// Transport defaults shared by all adapters
///
/// Per-capability settings override these.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl From<&PollerConfig> for AdapterConfig {
    fn from(config: &PollerConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            retries: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Run a network operation bounded by `timeout` and the cancellation token
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    fut: F,
) -> Result<T, PollError>
where
    F: Future<Output = Result<T, PollError>>,
{
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(PollError::Cancelled),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(res) => res,
            Err(_) => Err(PollError::Timeout {
                operation: operation.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        },
    }
}
