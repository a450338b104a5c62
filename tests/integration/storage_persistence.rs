//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Devices, capabilities and roles survive a reopen of the database
//! - Session upserts are idempotent by natural key
//! - History is append-only
//! - The full pipeline writes through the SQLite backend

use crate::helpers::*;
use chrono::Utc;
use ispmon::device::{ConnectionMethod, roles};
use ispmon::poll_result::{DhcpLease, NatSession, PppoeSession, SessionBatch};
use ispmon::storage::sqlite::SqliteStore;
use ispmon::storage::{DeviceRepository, HistoryRecord, MetricsStore};
use ispmon::{AdapterRegistry, PollResult, PollerHandle};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn pppoe(id: &str, user: &str) -> PppoeSession {
    PppoeSession {
        session_id: id.to_string(),
        username: user.to_string(),
        caller_id: None,
        address: Some("100.64.0.10".to_string()),
        uptime_seconds: Some(60),
    }
}

#[tokio::test]
async fn test_device_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("ispmon.db");

    let mut device = with_fallback_order(create_test_device("bng-1"), &["api", "snmp"]);
    device.roles = vec![role(roles::PPPOE_SERVER, 1), role(roles::NAT_GATEWAY, 2)];

    {
        let store = SqliteStore::new(&db_path).await.unwrap();
        store.upsert_device(&device).await.unwrap();
    }

    let store = SqliteStore::new(&db_path).await.unwrap();
    let loaded = store.get_device(device.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "bng-1");
    assert_eq!(loaded.tenant_id, device.tenant_id);

    let capabilities = store.load_capabilities(device.id).await.unwrap().unwrap();
    assert_eq!(capabilities.fallback_order, vec!["api", "snmp"]);

    let codes: Vec<_> = store
        .load_roles(device.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.code)
        .collect();
    assert_eq!(codes, vec!["pppoe_server", "nat_gateway"]);
}

#[tokio::test]
async fn test_session_upserts_are_idempotent() {
    let temp_dir = tempdir().unwrap();
    let store = SqliteStore::new(temp_dir.path().join("sessions.db")).await.unwrap();
    let device = create_test_device("bng-1");
    store.upsert_device(&device).await.unwrap();

    let batch = SessionBatch::Pppoe(vec![pppoe("*1", "alice"), pppoe("*2", "bob")]);
    for _ in 0..2 {
        let written = store
            .upsert_sessions(device.tenant_id, device.id, batch.clone())
            .await
            .unwrap();
        assert_eq!(written, 2);
    }
    assert_eq!(store.session_count(device.id, "pppoe").await.unwrap(), 2);

    let nat = NatSession {
        protocol: "tcp".to_string(),
        src_address: "10.0.0.2:51000".to_string(),
        dst_address: "198.51.100.7:443".to_string(),
        reply_src_address: None,
        state: Some("established".to_string()),
    };
    store
        .upsert_sessions(device.tenant_id, device.id, SessionBatch::Nat(vec![nat.clone(), nat]))
        .await
        .unwrap();
    assert_eq!(store.session_count(device.id, "nat").await.unwrap(), 1);

    let lease = |ip: &str| DhcpLease {
        mac_address: "AA:BB:CC:DD:EE:01".to_string(),
        ip_address: ip.to_string(),
        hostname: None,
        active: true,
    };
    store
        .upsert_sessions(
            device.tenant_id,
            device.id,
            SessionBatch::Dhcp(vec![lease("10.0.0.2"), lease("10.0.0.3"), lease("10.0.0.2")]),
        )
        .await
        .unwrap();
    assert_eq!(store.session_count(device.id, "dhcp").await.unwrap(), 2);
}

#[tokio::test]
async fn test_sessions_no_longer_reported_are_pruned() {
    let temp_dir = tempdir().unwrap();
    let store = SqliteStore::new(temp_dir.path().join("prune.db")).await.unwrap();
    let device = create_test_device("bng-1");
    let other = create_test_device("bng-2");
    for d in [&device, &other] {
        store.upsert_device(d).await.unwrap();
    }

    store
        .upsert_sessions(device.tenant_id, device.id, SessionBatch::Pppoe(vec![pppoe("*1", "alice"), pppoe("*2", "bob")]))
        .await
        .unwrap();
    store
        .upsert_sessions(other.tenant_id, other.id, SessionBatch::Pppoe(vec![pppoe("*9", "carol")]))
        .await
        .unwrap();

    // back to back calls may share a millisecond
    store
        .upsert_sessions(device.tenant_id, device.id, SessionBatch::Pppoe(vec![pppoe("*2", "bob"), pppoe("*3", "dave")]))
        .await
        .unwrap();
    assert_eq!(store.session_count(device.id, "pppoe").await.unwrap(), 2);

    store
        .upsert_sessions(device.tenant_id, device.id, SessionBatch::Pppoe(vec![pppoe("*4", "erin")]))
        .await
        .unwrap();
    assert_eq!(store.session_count(device.id, "pppoe").await.unwrap(), 1);

    // an empty batch prunes nothing
    store
        .upsert_sessions(device.tenant_id, device.id, SessionBatch::Pppoe(vec![]))
        .await
        .unwrap();
    assert_eq!(store.session_count(device.id, "pppoe").await.unwrap(), 1);

    assert_eq!(store.session_count(other.id, "pppoe").await.unwrap(), 1);
}

#[tokio::test]
async fn test_history_is_append_only() {
    let temp_dir = tempdir().unwrap();
    let store = SqliteStore::new(temp_dir.path().join("history.db")).await.unwrap();
    let device = create_test_device("r1");
    store.upsert_device(&device).await.unwrap();

    let mut first = PollResult::start(&device, "snmp");
    first.succeed();
    let mut second = first.clone();
    second.fail("timeout");

    store.write_history(HistoryRecord::from(&first)).await.unwrap();
    store.write_history(HistoryRecord::from(&second)).await.unwrap();
    // the exact same record again is still a new row
    store.write_history(HistoryRecord::from(&second)).await.unwrap();

    let history = store.query_history(device.id, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|h| h.success).count(), 1);
    assert_eq!(history[0].error_message.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_full_persistence_pipeline() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(temp_dir.path().join("pipeline.db")).await.unwrap());

    let devices: Vec<_> = (0..3).map(|i| create_test_device(&format!("r{i}"))).collect();
    for device in &devices {
        store.upsert_device(device).await.unwrap();
    }

    let mut registry = AdapterRegistry::new();
    registry.register(ScriptedAdapter::new("snmp", ConnectionMethod::Snmp, Behavior::Succeed));

    let poller = PollerHandle::spawn(
        &test_poller_config(2, 10),
        Arc::new(registry),
        store.clone(),
        store.clone(),
        CancellationToken::new(),
    );

    for device in &devices {
        wait_for_history(store.as_ref(), device.id, 1).await;
    }
    wait_until(|| poller.in_flight() == 0).await;
    let stats = poller.shutdown().await.unwrap();
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.storage_errors, 0);

    assert!(store.list_due(Utc::now(), 10).await.unwrap().is_empty());
    for device in &devices {
        let metrics = store.latest_metrics(device.id).await.unwrap().unwrap();
        assert_eq!(metrics.adapter, "snmp");
        assert_eq!(metrics.cpu_percent, Some(5.0));
        assert_eq!(store.consecutive_failures(device.id).await.unwrap(), Some(0));
    }
}
