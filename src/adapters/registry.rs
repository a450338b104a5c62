//! Adapter registry and fallback polling
//!
//! The registry is built once at startup and shared by all workers through an
//! `Arc`. Registration order is the default priority when a device expresses
//! no preference.
//!
//! ## Candidate selection
//!
//! 1. The device's method order (its explicit fallback order, or its
//!    preferred method followed by the other enabled methods). Each entry
//!    matches adapters by name (`mikrotik_api`) or by method (`api`). Only
//!    adapters that can handle the device are kept, in device order, without
//!    duplicates.
//! 2. If that yields nothing, every adapter that can handle the device, in
//!    registration order.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{AdapterConfig, MikrotikAdapter, PollerAdapter, SnmpAdapter};
use crate::device::Device;
use crate::error::PollError;
use crate::poll_result::PollResult;

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn PollerAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter: SNMP first, then RouterOS
    pub fn with_defaults(config: &AdapterConfig) -> reqwest::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(SnmpAdapter::new(config.clone())));
        registry.register(Arc::new(MikrotikAdapter::new(config.clone())?));
        Ok(registry)
    }

    /// Append an adapter. A second adapter with an already registered name is rejected.
    pub fn register(&mut self, adapter: Arc<dyn PollerAdapter>) -> bool {
        if self.adapter_by_name(adapter.name()).is_some() {
            warn!("adapter {} already registered, ignoring", adapter.name());
            return false;
        }

        info!(
            "registered adapter {} ({})",
            adapter.name(),
            adapter.method()
        );
        self.adapters.push(adapter);
        true
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn adapter_by_name(&self, name: &str) -> Option<Arc<dyn PollerAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    /// Ordered candidate adapters for `device`
    ///
    /// Deterministic and free of side effects; see the module docs for the
    /// resolution rules.
    pub fn select_ordered(&self, device: &Device) -> Vec<Arc<dyn PollerAdapter>> {
        let mut selected: Vec<Arc<dyn PollerAdapter>> = Vec::new();

        for entry in device.method_order() {
            for adapter in &self.adapters {
                let matches = adapter.name() == entry || adapter.method().as_str() == entry;
                let already = selected.iter().any(|s| s.name() == adapter.name());
                if matches && !already && adapter.can_handle(device) {
                    selected.push(adapter.clone());
                }
            }
        }

        if selected.is_empty() {
            selected = self
                .adapters
                .iter()
                .filter(|adapter| adapter.can_handle(device))
                .cloned()
                .collect();
        }

        selected
    }

    /// Poll `device`, falling through the candidates until one succeeds
    ///
    /// Returns [`PollError::NoSuitableAdapter`] without touching the network
    /// when nothing can handle the device, and
    /// [`PollError::AllAdaptersFailed`] carrying the last failure once every
    /// candidate was tried.
    #[instrument(skip_all, fields(device = %device.name))]
    pub async fn poll_with_fallback(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<PollResult, PollError> {
        let candidates = self.select_ordered(device);
        if candidates.is_empty() {
            return Err(PollError::NoSuitableAdapter {
                device: device.name.clone(),
            });
        }

        trace!(
            "candidates: {:?}",
            candidates.iter().map(|a| a.name()).collect::<Vec<_>>()
        );

        let mut last_error = String::new();
        for (attempt, adapter) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }

            let polled = AssertUnwindSafe(adapter.poll(cancel, device))
                .catch_unwind()
                .await;
            let result = match polled {
                Ok(Ok(result)) => result,
                // identical handling: the failure result carries the same message
                Ok(Err(failure)) => *failure.result,
                Err(_) => {
                    warn!("adapter {} panicked while polling", adapter.name());
                    let mut result = PollResult::start(device, adapter.name());
                    result.fail("adapter panicked during poll");
                    result
                }
            };

            if result.success {
                if attempt > 0 {
                    info!(
                        "polled via fallback adapter {} after {attempt} failure(s)",
                        adapter.name()
                    );
                }
                return Ok(result);
            }

            let message = result
                .error
                .unwrap_or_else(|| "poll reported failure".to_string());
            debug!("adapter {} failed: {message}", adapter.name());
            last_error = format!("{}: {message}", adapter.name());
        }

        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        Err(PollError::AllAdaptersFailed {
            attempted: candidates.len(),
            last_error,
        })
    }

    /// Health-check `device` through the candidates, stopping at the first
    /// adapter that succeeds. Returns that adapter's name.
    #[instrument(skip_all, fields(device = %device.name))]
    pub async fn health_check_with_fallback(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<String, PollError> {
        let candidates = self.select_ordered(device);
        if candidates.is_empty() {
            return Err(PollError::NoSuitableAdapter {
                device: device.name.clone(),
            });
        }

        let mut last_error = String::new();
        for adapter in &candidates {
            match adapter.health_check(cancel, device).await {
                Ok(()) => return Ok(adapter.name().to_string()),
                Err(PollError::Cancelled) => return Err(PollError::Cancelled),
                Err(e) => {
                    debug!("health check via {} failed: {e}", adapter.name());
                    last_error = format!("{}: {e}", adapter.name());
                }
            }
        }

        Err(PollError::AllAdaptersFailed {
            attempted: candidates.len(),
            last_error,
        })
    }

    /// Union of the metrics advertised by every adapter able to handle `device`
    pub fn supported_metrics(&self, device: &Device) -> BTreeSet<&'static str> {
        self.adapters
            .iter()
            .filter(|adapter| adapter.can_handle(device))
            .flat_map(|adapter| adapter.supported_metrics().iter().copied())
            .collect()
    }
}
