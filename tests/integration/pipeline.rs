//! End-to-end tests of scheduler → workers → result processor

use crate::helpers::*;
use chrono::{Duration as ChronoDuration, Utc};
use ispmon::device::ConnectionMethod;
use ispmon::storage::{DeviceRepository, MemoryStore, MetricsStore};
use ispmon::{AdapterRegistry, Device, PollerHandle};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn seed(store: &MemoryStore, devices: &[Device]) {
    for device in devices {
        store.upsert_device(device).await.unwrap();
    }
}

fn registry_with(adapters: Vec<Arc<ScriptedAdapter>>) -> Arc<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        assert!(registry.register(adapter));
    }
    Arc::new(registry)
}

fn spawn_poller(
    workers: usize,
    concurrent: usize,
    registry: Arc<AdapterRegistry>,
    store: &Arc<MemoryStore>,
) -> PollerHandle {
    PollerHandle::spawn(
        &test_poller_config(workers, concurrent),
        registry,
        store.clone(),
        store.clone(),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_all_due_devices_polled_once() {
    let store = Arc::new(MemoryStore::new());
    let devices: Vec<_> = (0..5).map(|i| create_test_device(&format!("r{i}"))).collect();
    seed(&store, &devices).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed);
    let poller = spawn_poller(2, 10, registry_with(vec![adapter.clone()]), &store);

    for device in &devices {
        wait_for_history(store.as_ref(), device.id, 1).await;
    }
    wait_until(|| poller.in_flight() == 0).await;

    // everything was just polled: nothing is due again
    assert_eq!(poller.tick_now().await.unwrap(), 0);

    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.storage_errors, 0);
    assert_eq!(adapter.polls(), 5);

    for device in &devices {
        let stored = store.get_device(device.id).await.unwrap().unwrap();
        assert!(stored.last_polled_at.is_some());
        let metrics = store.latest_metrics(device.id).await.unwrap();
        assert_eq!(metrics.cpu_percent, Some(5.0));
    }
}

#[tokio::test]
async fn test_concurrency_bounded_by_workers() {
    let store = Arc::new(MemoryStore::new());
    let devices: Vec<_> = (0..10).map(|i| create_test_device(&format!("r{i}"))).collect();
    seed(&store, &devices).await;

    let adapter = ScriptedAdapter::new(
        "snmp",
        ConnectionMethod::Snmp,
        Behavior::Slow(Duration::from_millis(50)),
    );
    let poller = spawn_poller(3, 10, registry_with(vec![adapter.clone()]), &store);

    for device in &devices {
        wait_for_history(store.as_ref(), device.id, 1).await;
    }

    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.succeeded, 10);
    assert!(adapter.max_active() <= 3, "max active {}", adapter.max_active());
}

#[tokio::test]
async fn test_concurrency_bounded_by_admission_limit() {
    let store = Arc::new(MemoryStore::new());
    let devices: Vec<_> = (0..10).map(|i| create_test_device(&format!("r{i}"))).collect();
    seed(&store, &devices).await;

    let adapter = ScriptedAdapter::new(
        "snmp",
        ConnectionMethod::Snmp,
        Behavior::Slow(Duration::from_millis(50)),
    );
    let poller = spawn_poller(8, 2, registry_with(vec![adapter.clone()]), &store);

    // the first pass admits two devices; keep ticking until all are done
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut done = 0;
            for device in &devices {
                if store.get_device(device.id).await.unwrap().unwrap().last_polled_at.is_some() {
                    done += 1;
                }
            }
            if done == devices.len() {
                break;
            }
            poller.tick_now().await.unwrap();
            assert!(poller.in_flight() <= 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.succeeded, 10);
    assert!(adapter.max_active() <= 2, "max active {}", adapter.max_active());
}

#[tokio::test]
async fn test_failed_device_stays_due() {
    let store = Arc::new(MemoryStore::new());
    let device = create_test_device("flaky");
    seed(&store, std::slice::from_ref(&device)).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Fail("timeout"));
    let poller = spawn_poller(1, 4, registry_with(vec![adapter.clone()]), &store);

    let history = wait_for_history(store.as_ref(), device.id, 1).await;
    wait_until(|| poller.in_flight() == 0).await;

    assert!(!history[0].success);
    assert_eq!(
        history[0].error_message.as_deref(),
        Some("all 1 adapters failed, last error: snmp: timeout")
    );

    let stored = store.get_device(device.id).await.unwrap().unwrap();
    assert_eq!(stored.last_polled_at, None);
    assert_eq!(store.consecutive_failures(device.id).await, Some(1));

    // still due, so the next pass admits it again
    assert_eq!(poller.tick_now().await.unwrap(), 1);
    wait_for_history(store.as_ref(), device.id, 2).await;

    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(adapter.polls(), 2);
}

#[tokio::test]
async fn test_device_due_again_after_interval() {
    let store = Arc::new(MemoryStore::new());
    let mut device = create_test_device("r1");
    device.last_polled_at = Some(Utc::now() - ChronoDuration::seconds(61));
    seed(&store, std::slice::from_ref(&device)).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed);
    let poller = spawn_poller(1, 4, registry_with(vec![adapter]), &store);

    let history = wait_for_history(store.as_ref(), device.id, 1).await;
    wait_until(|| poller.in_flight() == 0).await;
    poller.shutdown().await.unwrap();

    let stored = store.get_device(device.id).await.unwrap().unwrap();
    let polled_at = stored.last_polled_at.unwrap();
    assert_eq!(polled_at, history[0].poll_started_at);

    let now = Utc::now();
    assert!(store.list_due(now, 10).await.unwrap().is_empty());
    assert_eq!(
        store.list_due(polled_at + ChronoDuration::seconds(61), 10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_fallback_adapter_recorded_in_history() {
    let store = Arc::new(MemoryStore::new());
    let device = with_fallback_order(create_test_device("ccr-1"), &["api", "snmp"]);
    seed(&store, std::slice::from_ref(&device)).await;

    let snmp = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed);
    let api = ScriptedAdapter::new("mikrotik_api", ConnectionMethod::Api, Behavior::SessionFail);
    let poller = spawn_poller(1, 4, registry_with(vec![snmp.clone(), api.clone()]), &store);

    let history = wait_for_history(store.as_ref(), device.id, 1).await;
    poller.shutdown().await.unwrap();

    assert!(history[0].success);
    assert_eq!(history[0].adapter_used, "snmp");
    assert_eq!(api.polls(), 1);
    assert_eq!(snmp.polls(), 1);
}

#[tokio::test]
async fn test_device_without_adapter_records_none() {
    let store = Arc::new(MemoryStore::new());
    let device = create_test_device("orphan");
    seed(&store, std::slice::from_ref(&device)).await;

    let poller = spawn_poller(1, 4, Arc::new(AdapterRegistry::new()), &store);

    let history = wait_for_history(store.as_ref(), device.id, 1).await;
    let stats = poller.shutdown().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(history[0].adapter_used, "none");
    assert!(
        history[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("no suitable adapter")
    );
}

#[tokio::test]
async fn test_panicking_adapter_becomes_failure() {
    let store = Arc::new(MemoryStore::new());
    let devices = [create_test_device("a"), create_test_device("b")];
    seed(&store, &devices).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Panic);
    let poller = spawn_poller(1, 4, registry_with(vec![adapter]), &store);

    // the single worker survives the first panic and polls the second device
    for device in &devices {
        let history = wait_for_history(store.as_ref(), device.id, 1).await;
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("all 1 adapters failed, last error: snmp: adapter panicked during poll")
        );
    }

    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.failed, 2);
}

#[tokio::test]
async fn test_shutdown_persists_in_flight_results() {
    let store = Arc::new(MemoryStore::new());
    let devices = [create_test_device("a"), create_test_device("b")];
    seed(&store, &devices).await;

    let adapter = ScriptedAdapter::new(
        "snmp",
        ConnectionMethod::Snmp,
        Behavior::Slow(Duration::from_secs(30)),
    );
    let poller = spawn_poller(2, 4, registry_with(vec![adapter.clone()]), &store);

    wait_until(|| adapter.polls() == 2).await;
    let stats = tokio::time::timeout(Duration::from_secs(5), poller.shutdown())
        .await
        .expect("shutdown should not wait for slow polls")
        .unwrap();

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 2);
    for device in &devices {
        let history = store.query_history(device.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error_message.as_deref(), Some("poll cancelled"));

        // cancelled polls do not count as polled
        let stored = store.get_device(device.id).await.unwrap().unwrap();
        assert_eq!(stored.last_polled_at, None);
        assert_eq!(store.consecutive_failures(device.id).await, Some(0));
    }
}

#[tokio::test]
async fn test_poll_now_admits_device_that_is_not_due() {
    let store = Arc::new(MemoryStore::new());
    let mut device = create_test_device("r1");
    device.last_polled_at = Some(Utc::now());
    seed(&store, std::slice::from_ref(&device)).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed);
    let poller = spawn_poller(1, 4, registry_with(vec![adapter.clone()]), &store);

    assert_eq!(poller.tick_now().await.unwrap(), 0);
    assert!(poller.poll_now(device.id).await.unwrap());
    wait_for_history(store.as_ref(), device.id, 1).await;

    poller.shutdown().await.unwrap();
    assert_eq!(adapter.polls(), 1);
}

#[tokio::test]
async fn test_disabled_and_inactive_devices_never_polled() {
    let store = Arc::new(MemoryStore::new());
    let mut disabled = create_test_device("disabled");
    disabled.polling_enabled = false;
    let mut inactive = create_test_device("inactive");
    inactive.status = ispmon::DeviceStatus::Inactive;
    let active = create_test_device("active");
    seed(&store, &[disabled.clone(), inactive.clone(), active.clone()]).await;

    let adapter = ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed);
    let poller = spawn_poller(2, 4, registry_with(vec![adapter.clone()]), &store);

    wait_for_history(store.as_ref(), active.id, 1).await;
    assert_eq!(poller.tick_now().await.unwrap(), 0);
    poller.shutdown().await.unwrap();

    assert_eq!(adapter.polls(), 1);
    assert!(store.query_history(disabled.id, 10).await.unwrap().is_empty());
    assert!(store.query_history(inactive.id, 10).await.unwrap().is_empty());
}
