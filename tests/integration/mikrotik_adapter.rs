//! RouterOS REST adapter against a mock HTTP server

use crate::helpers::*;
use assert_matches::assert_matches;
use ispmon::adapters::{AdapterConfig, MikrotikAdapter};
use ispmon::device::{CapabilitySet, Device, roles};
use ispmon::poll_result::keys;
use ispmon::{MetricValue, PollError, PollerAdapter};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn device_for(mock_server: &MockServer, device_roles: &[&str]) -> Device {
    let mock_url = url::Url::parse(&mock_server.uri()).unwrap();

    let mut device = create_test_device("ccr-1");
    device.management_ip = mock_url.host_str().unwrap().parse().unwrap();
    device.capabilities = Some(CapabilitySet {
        api: Some(create_api_capability(mock_url.port().unwrap())),
        ..Default::default()
    });
    device.roles = device_roles
        .iter()
        .enumerate()
        .map(|(i, code)| role(code, i as i32 + 1))
        .collect();
    device
}

fn adapter() -> MikrotikAdapter {
    MikrotikAdapter::new(AdapterConfig {
        timeout: Duration::from_secs(2),
        retries: 0,
        retry_delay: Duration::from_millis(10),
    })
    .unwrap()
}

async fn mount_system_resource(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cpu-load": "12",
            "total-memory": "1073741824",
            "free-memory": "268435456",
            "uptime": "1w2d3h4m5s",
            "board-name": "CCR2004-1G-12S+2XS",
            "version": "7.15.3 (stable)"
        })))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/interface"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "name": "ether1", "running": "true", "disabled": "false", "rx-byte": "1000", "tx-byte": "2000" },
            { "name": "sfp-sfpplus1", "running": "false", "disabled": "true" }
        ])))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_poll_collects_system_and_interfaces() {
    let mock_server = MockServer::start().await;
    mount_system_resource(&mock_server).await;

    let device = device_for(&mock_server, &[roles::EDGE_ROUTER]);
    let result = adapter()
        .poll(&CancellationToken::new(), &device)
        .await
        .unwrap();

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.adapter, "mikrotik_api");
    assert_eq!(result.metric(keys::CPU_PERCENT), Some(&MetricValue::Float(12.0)));
    assert_eq!(result.metric(keys::MEMORY_PERCENT), Some(&MetricValue::Float(75.0)));
    assert_eq!(result.metric(keys::MEMORY_TOTAL_MB), Some(&MetricValue::Integer(1024)));
    assert_eq!(
        result.metric(keys::UPTIME_SECONDS),
        Some(&MetricValue::Integer(7 * 86400 + 2 * 86400 + 3 * 3600 + 4 * 60 + 5))
    );
    assert_eq!(result.interfaces.len(), 2);
    assert!(result.interfaces[0].oper_up);
    assert!(!result.interfaces[1].admin_up);

    // no role: no session collection
    assert!(result.pppoe_sessions.is_empty());
    assert!(result.dhcp_leases.is_empty());
}

#[tokio::test]
async fn test_absurd_uptime_is_dropped_not_fatal() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cpu-load": "3",
            "uptime": "9999999999999999999w"
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/interface"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&mock_server)
        .await;

    let device = device_for(&mock_server, &[]);
    let result = adapter()
        .poll(&CancellationToken::new(), &device)
        .await
        .unwrap();

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.metric(keys::CPU_PERCENT), Some(&MetricValue::Float(3.0)));
    assert_eq!(result.metric(keys::UPTIME_SECONDS), None);
}

#[tokio::test]
async fn test_role_collections_follow_roles() {
    let mock_server = MockServer::start().await;
    mount_system_resource(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/rest/ppp/active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { ".id": "*1", "name": "alice", "caller-id": "AA:BB:CC:00:00:01", "address": "100.64.0.10", "uptime": "2h" },
            { ".id": "*2", "name": "bob", "address": "100.64.0.11", "uptime": "15m30s" }
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/dhcp-server/lease"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "mac-address": "aa:bb:cc:dd:ee:01", "address": "10.0.0.2", "host-name": "laptop", "status": "bound" },
            { "mac-address": "aa:bb:cc:dd:ee:02", "address": "10.0.0.3", "status": "waiting" }
        ])))
        .mount(&mock_server)
        .await;

    // NAT role present but endpoint failing: partial failure only
    Mock::given(method("GET"))
        .and(path("/rest/ip/firewall/connection"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let device = device_for(
        &mock_server,
        &[roles::PPPOE_SERVER, roles::DHCP_SERVER, roles::NAT_GATEWAY],
    );
    let result = adapter()
        .poll(&CancellationToken::new(), &device)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.pppoe_sessions.len(), 2);
    assert_eq!(result.pppoe_sessions[0].username, "alice");
    assert_eq!(result.pppoe_sessions[1].uptime_seconds, Some(930));
    assert_eq!(result.metric(keys::PPPOE_ACTIVE_SESSIONS), Some(&MetricValue::Integer(2)));

    assert_eq!(result.dhcp_leases.len(), 2);
    assert_eq!(result.dhcp_leases[0].mac_address, "AA:BB:CC:DD:EE:01");
    assert!(result.dhcp_leases[0].active);
    assert!(!result.dhcp_leases[1].active);

    assert!(result.nat_sessions.is_empty());
    assert_eq!(result.metric(keys::NAT_TOTAL_SESSIONS), None);
}

#[tokio::test]
async fn test_rejected_credentials_are_session_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let device = device_for(&mock_server, &[]);
    let failure = adapter()
        .poll(&CancellationToken::new(), &device)
        .await
        .unwrap_err();

    assert_matches!(failure.error, PollError::Auth { .. });
    assert!(!failure.result.success);
    assert_eq!(failure.result.error, Some(failure.error.to_string()));
}

#[tokio::test]
async fn test_health_check() {
    let mock_server = MockServer::start().await;
    mount_system_resource(&mock_server).await;

    let device = device_for(&mock_server, &[]);
    adapter()
        .health_check(&CancellationToken::new(), &device)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_slow_router_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let device = device_for(&mock_server, &[]);
    let err = adapter()
        .health_check(&CancellationToken::new(), &device)
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_matches!(err, PollError::Timeout { .. });
}
