// tests/integration/reconciler_test.rs

//! End-to-end reconciler scenarios against the mock Dataplane API.

use super::fixtures::{BACKEND, haproxy_config, inst, inst_in_az, key, svc};
use super::mock_dataplane::{MockDataplane, seeded_servers};
use haproxy_cloud_discovery::config::ApiVersion;
use haproxy_cloud_discovery::core::errors::DiscoveryError;
use haproxy_cloud_discovery::core::haproxy::reconciler::Reconciler;
use serde_json::Value;

#[tokio::test]
async fn test_first_time_bring_up_creates_backend_and_ten_slots() {
    let mock = MockDataplane::start().await;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1"), inst("b", "10.0.0.2")]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    assert!(state.backends.contains_key(BACKEND));
    assert_eq!(state.created_backends.len(), 1);
    assert_eq!(state.created_servers.len(), 10);
    assert_eq!(state.commits, 1);

    // Slots are assigned in instance-id order: a -> srv1, b -> srv2.
    let (_, srv1) = &state.created_servers[0];
    assert_eq!(srv1["name"], "srv1");
    assert_eq!(srv1["address"], "10.0.0.1");
    assert_eq!(srv1["port"], 8080);
    assert_eq!(srv1["maintenance"], "disabled");
    assert_eq!(srv1["check"], "enabled");
    assert_eq!(srv1["cookie"], "srv1");

    let (_, srv2) = &state.created_servers[1];
    assert_eq!(srv2["name"], "srv2");
    assert_eq!(srv2["address"], "10.0.0.2");

    // srv3..srv10 are maintenance placeholders.
    for (_, payload) in &state.created_servers[2..] {
        assert_eq!(payload["address"], "127.0.0.1");
        assert_eq!(payload["port"], 80);
        assert_eq!(payload["maintenance"], "enabled");
        assert_eq!(payload["check"], "disabled");
        assert!(payload.get("cookie").is_none());
    }
}

#[tokio::test]
async fn test_noop_reconcile_issues_no_writes() {
    let mock = MockDataplane::start().await;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    reconciler.reconcile(&[], &[]).await.unwrap();

    let state = mock.state.lock();
    assert_eq!(state.transactions_created, 0);
    assert_eq!(state.commits, 0);
    assert!(state.created_servers.is_empty());
}

#[tokio::test]
async fn test_scale_up_transitions_slot_from_maintenance() {
    let mock = MockDataplane::start().await;
    mock.seed_backend(BACKEND, seeded_servers(&["10.0.0.1", "10.0.0.2"]));
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![
        inst("a", "10.0.0.1"),
        inst("b", "10.0.0.2"),
        inst("c", "10.0.0.3"),
    ]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    // Backend existed already, so it must not be re-created.
    assert!(state.created_backends.is_empty());
    // All ten slots already exist, so everything goes through PUT.
    assert!(state.created_servers.is_empty());
    assert_eq!(state.replaced_servers.len(), 10);

    let srv3 = state
        .replaced_servers
        .iter()
        .map(|(_, payload)| payload)
        .find(|payload| payload["name"] == "srv3")
        .expect("srv3 must be written");
    assert_eq!(srv3["address"], "10.0.0.3");
    assert_eq!(srv3["port"], 8080);
    assert_eq!(srv3["maintenance"], "disabled");

    assert_eq!(state.commits, 1);
    assert!(state.deleted_servers.is_empty());
}

#[tokio::test]
async fn test_removed_service_disables_servers_but_keeps_backend() {
    let mock = MockDataplane::start().await;
    mock.seed_backend(BACKEND, seeded_servers(&["10.0.0.1", "10.0.0.2"]));
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    reconciler.reconcile(&[], &[key()]).await.unwrap();

    let state = mock.state.lock();
    assert_eq!(state.replaced_servers.len(), 10);
    for (_, payload) in &state.replaced_servers {
        assert_eq!(payload["maintenance"], "enabled");
        assert_eq!(payload["address"], "127.0.0.1");
    }
    // The backend itself is never deleted.
    assert!(state.backends.contains_key(BACKEND));
    assert_eq!(state.commits, 1);
}

#[tokio::test]
async fn test_removed_service_with_unknown_backend_is_noop() {
    let mock = MockDataplane::start().await;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    reconciler.reconcile(&[], &[key()]).await.unwrap();

    let state = mock.state.lock();
    assert!(state.replaced_servers.is_empty());
    // The transaction ran but recorded a change for the removal attempt, so
    // a commit still happens; no server writes were issued.
    assert!(state.created_servers.is_empty());
}

#[tokio::test]
async fn test_shrink_below_previous_high_water_deletes_extra_servers() {
    let mock = MockDataplane::start().await;
    // Twelve pre-existing slots from an earlier larger deployment.
    let mut servers = seeded_servers(&["10.0.0.1", "10.0.0.2"]);
    for i in 11..=12 {
        servers.push(serde_json::json!({
            "name": format!("srv{i}"),
            "address": "127.0.0.1",
            "port": 80,
            "maintenance": "enabled",
            "check": "disabled",
        }));
    }
    mock.seed_backend(BACKEND, servers);
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1")]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    let mut deleted: Vec<&str> = state
        .deleted_servers
        .iter()
        .map(|(_, name)| name.as_str())
        .collect();
    deleted.sort();
    assert_eq!(deleted, vec!["srv11", "srv12"]);
}

#[tokio::test]
async fn test_version_conflict_retries_and_succeeds() {
    let mock = MockDataplane::start().await;
    mock.state.lock().fail_commits = 1;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1")]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    // Two full transaction runs: the conflicted one plus the retry.
    assert_eq!(state.transactions_created, 2);
    assert_eq!(state.commits, 1);
}

#[tokio::test]
async fn test_version_conflict_exhausts_after_three_attempts() {
    let mock = MockDataplane::start().await;
    mock.state.lock().fail_commits = 3;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1")]);
    let err = reconciler.reconcile(&[service], &[]).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::VersionConflict));

    let state = mock.state.lock();
    assert_eq!(state.transactions_created, 3);
    assert_eq!(state.commits, 0);
}

#[tokio::test]
async fn test_server_write_failure_aborts_transaction() {
    let mock = MockDataplane::start().await;
    mock.state.lock().fail_server_writes = true;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V2)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1")]);
    let err = reconciler.reconcile(&[service], &[]).await.unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::Dataplane { status: 500, .. }
    ));

    let state = mock.state.lock();
    assert_eq!(state.commits, 0);
    // The failed transaction must be deleted on the error path.
    assert_eq!(state.transactions_deleted, 1);
}

#[tokio::test]
async fn test_az_weighting_applied_to_created_servers() {
    let mock = MockDataplane::start().await;
    let mut config = haproxy_config(&mock.base_url, ApiVersion::V2);
    config.availability_zone = Some("1".to_string());
    let reconciler = Reconciler::new(&config).unwrap();

    let service = svc(vec![
        inst_in_az("a", "10.0.0.1", "1", "10"),
        inst_in_az("b", "10.0.0.2", "2", "10"),
    ]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    let payload_for = |name: &str| -> &Value {
        state
            .created_servers
            .iter()
            .map(|(_, payload)| payload)
            .find(|payload| payload["name"] == name)
            .unwrap()
    };

    // Same AZ as the load balancer: weight = 100 - 10.
    assert_eq!(payload_for("srv1")["weight"], 90);
    assert!(payload_for("srv1").get("backup").is_none());
    // Other AZ: weight = 10.
    assert_eq!(payload_for("srv2")["weight"], 10);
    assert!(payload_for("srv2").get("backup").is_none());
    // Maintenance slots carry neither field.
    assert!(payload_for("srv3").get("weight").is_none());
    assert!(payload_for("srv3").get("backup").is_none());
}

#[tokio::test]
async fn test_backend_options_merged_into_creation_payload() {
    let mock = MockDataplane::start().await;
    let mut config = haproxy_config(&mock.base_url, ApiVersion::V2);
    config.backend_options.insert(
        "app".to_string(),
        serde_json::from_value(serde_json::json!({
            "cookie": { "name": "STICK", "type": "insert" }
        }))
        .unwrap(),
    );
    let reconciler = Reconciler::new(&config).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1")]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    let backend = &state.created_backends[0];
    assert_eq!(backend["name"], BACKEND);
    assert_eq!(backend["mode"], "http");
    assert_eq!(backend["balance"]["algorithm"], "roundrobin");
    assert_eq!(backend["cookie"]["name"], "STICK");
}

#[tokio::test]
async fn test_v3_nested_server_endpoints() {
    let mock = MockDataplane::start().await;
    let reconciler =
        Reconciler::new(&haproxy_config(&mock.base_url, ApiVersion::V3)).unwrap();

    let service = svc(vec![inst("a", "10.0.0.1"), inst("b", "10.0.0.2")]);
    reconciler.reconcile(&[service], &[]).await.unwrap();

    let state = mock.state.lock();
    assert_eq!(state.created_backends.len(), 1);
    assert_eq!(state.created_servers.len(), 10);
    assert_eq!(state.commits, 1);
    assert!(state.created_servers.iter().all(|(backend, _)| backend == BACKEND));
}
