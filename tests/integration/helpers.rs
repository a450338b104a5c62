//! Helper functions for integration tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ispmon::config::PollerConfig;
use ispmon::device::{
    ApiCapability, CapabilitySet, ConnectionMethod, Device, DeviceStatus, RoleAssignment,
};
use ispmon::{PollError, PollResult, PollerAdapter, SessionFailure};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn create_test_device(name: &str) -> Device {
    Device {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        name: name.to_string(),
        management_ip: "192.0.2.1".parse().unwrap(),
        vendor: Some("mikrotik".to_string()),
        status: DeviceStatus::Active,
        polling_enabled: true,
        polling_interval_secs: 60,
        last_polled_at: None,
        capabilities: None,
        roles: vec![],
    }
}

pub fn create_api_capability(port: u16) -> ApiCapability {
    serde_json::from_value(serde_json::json!({
        "enabled": true,
        "kind": "mikrotik",
        "port": port,
        "username": "monitor",
        "password": "s3cret",
        "use_tls": false,
    }))
    .unwrap()
}

pub fn with_fallback_order(mut device: Device, order: &[&str]) -> Device {
    device.capabilities = Some(CapabilitySet {
        fallback_order: order.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    });
    device
}

pub fn role(code: &str, priority: i32) -> RoleAssignment {
    RoleAssignment {
        code: code.to_string(),
        name: None,
        priority,
        is_primary: priority == 1,
    }
}

/// Fast pipeline configuration with a tick long enough that only the
/// immediate first pass and explicit commands schedule anything
pub fn test_poller_config(workers: usize, concurrent: usize) -> PollerConfig {
    PollerConfig {
        worker_count: workers,
        concurrent_polls: concurrent,
        tick_interval_secs: 3600,
        timeout_secs: 2,
        retry_attempts: 0,
        retry_delay_ms: 10,
        failure_threshold: 3,
        result_queue_capacity: None,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    SessionFail,
    /// Sleep, then succeed; aborted when cancelled
    Slow(Duration),
    Panic,
}

/// Adapter with scripted outcomes that records how many polls overlap
pub struct ScriptedAdapter {
    name: &'static str,
    method: ConnectionMethod,
    behavior: Behavior,
    pub polls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &'static str, method: ConnectionMethod, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            method,
            behavior,
            polls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PollerAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn method(&self) -> ConnectionMethod {
        self.method
    }

    fn can_handle(&self, _device: &Device) -> bool {
        true
    }

    async fn poll(
        &self,
        cancel: &CancellationToken,
        device: &Device,
    ) -> Result<PollResult, SessionFailure> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let mut result = PollResult::start(device, self.name);
        match self.behavior {
            Behavior::Succeed => {
                result.set_metric("cpu_percent", 5i64);
                result.succeed();
                Ok(result)
            }
            Behavior::Fail(msg) => {
                result.fail(msg);
                Ok(result)
            }
            Behavior::SessionFail => Err(SessionFailure::new(
                PollError::Connect {
                    target: device.management_ip.to_string(),
                    reason: "connection refused".to_string(),
                },
                result,
            )),
            Behavior::Slow(delay) => {
                tokio::select! {
                    () = cancel.cancelled() => {
                        Err(SessionFailure::new(PollError::Cancelled, result))
                    }
                    () = tokio::time::sleep(delay) => {
                        result.succeed();
                        Ok(result)
                    }
                }
            }
            Behavior::Panic => panic!("scripted adapter panic"),
        }
    }

    async fn health_check(
        &self,
        _cancel: &CancellationToken,
        _device: &Device,
    ) -> Result<(), PollError> {
        match self.behavior {
            Behavior::Succeed | Behavior::Slow(_) => Ok(()),
            _ => Err(PollError::Protocol("scripted failure".to_string())),
        }
    }

    fn supported_metrics(&self) -> &[&'static str] {
        &["cpu_usage"]
    }
}

/// Wait until `device_id` has at least `count` history records
pub async fn wait_for_history(
    store: &dyn ispmon::storage::MetricsStore,
    device_id: Uuid,
    count: usize,
) -> Vec<ispmon::storage::HistoryRecord> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let history = store.query_history(device_id, 100).await.unwrap();
            if history.len() >= count {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for polling history")
}

/// Wait until `condition` holds, polling every few milliseconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}
