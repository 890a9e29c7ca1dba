//! Registry behaviour across catalogs
//!
//! TigerStyle: Deterministic clock and RNG; every scenario is reproducible.

use async_trait::async_trait;
use meshwork_core::config::{CircuitBreakerConfig, RegistryConfig};
use meshwork_core::io::{IoContext, ManualClock};
use meshwork_registry::{
    ActionHandler, ActionSchema, CallOutcome, CircuitState, Context, Endpoint, EventContext,
    EventHandler, EventSchema, HandlerError, ListOptions, NodeId, NodeInfo, NodeInfoOutcome,
    Registry, RegistryError, RegistryEvent, ServiceDefinition, ServiceVersion,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Helpers
// =============================================================================

const HEARTBEAT_TIMEOUT_MS: u64 = 300;

struct Echo;

#[async_trait]
impl ActionHandler for Echo {
    async fn call(&self, ctx: Context) -> Result<Value, HandlerError> {
        Ok(ctx.params)
    }
}

struct Counting {
    calls: Arc<AtomicUsize>,
    fail_with: Option<&'static str>,
}

#[async_trait]
impl EventHandler for Counting {
    async fn handle(&self, _ctx: EventContext) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(reason) => Err(HandlerError::new(reason)),
            None => Ok(()),
        }
    }
}

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

fn registry(clock: Arc<ManualClock>, prefer_local: bool, breaker: CircuitBreakerConfig) -> Registry {
    Registry::builder()
        .node_id(node("node-a"))
        .instance_id("inst-a")
        .config(RegistryConfig {
            prefer_local,
            ..Default::default()
        })
        .circuit_breaker(breaker)
        .io(IoContext::for_testing(clock, 17))
        .build()
}

fn remote_info(sender: &str, seq: u64, service: &str, actions: &[&str]) -> NodeInfo {
    let mut def = ServiceDefinition::new(service);
    for action in actions {
        def = def.with_action(ActionSchema::new(*action));
    }
    let mut info = NodeInfo::new(node(sender), format!("inst-{}", sender));
    info.seq = seq;
    info.services = vec![def.to_info()];
    info
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_prefer_local_then_failover_when_local_circuit_opens() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(clock.clone(), true, CircuitBreakerConfig::enabled());

    registry
        .register_local_service(
            ServiceDefinition::new("users")
                .with_action(ActionSchema::new("find").with_handler(Arc::new(Echo))),
        )
        .await
        .unwrap();
    registry
        .process_node_info(remote_info("node-b", 1, "users", &["find"]))
        .await
        .unwrap();

    for _ in 0..10 {
        let ep = registry
            .next_action_endpoint("users.find", None, None)
            .await
            .unwrap();
        assert_eq!(ep.node_id(), &node("node-a"));
        assert!(ep.is_local());
        assert!(ep.handler().is_some());
    }

    // 21 failures on the local endpoint open its breaker
    for _ in 0..21 {
        registry
            .report_action_outcome("users.find", &node("node-a"), CallOutcome::Timeout)
            .await
            .unwrap();
    }
    let local = registry.local_action_endpoint("users.find").await;
    assert!(local.is_none());

    for _ in 0..10 {
        let ep = registry
            .next_action_endpoint("users.find", None, None)
            .await
            .unwrap();
        assert_eq!(ep.node_id(), &node("node-b"));
    }

    // After the half-open delay a trial call reaches the local endpoint again
    clock.advance_ms(CircuitBreakerConfig::default().half_open_time_ms);
    let ep = registry
        .next_action_endpoint("users.find", None, None)
        .await
        .unwrap();
    assert_eq!(ep.node_id(), &node("node-a"));
    assert_eq!(ep.circuit_state(), CircuitState::HalfOpen);

    // The trial is outstanding, so other calls keep failing over
    for _ in 0..3 {
        let other = registry
            .next_action_endpoint("users.find", None, None)
            .await
            .unwrap();
        assert_eq!(other.node_id(), &node("node-b"));
    }

    registry
        .report_action_outcome("users.find", &node("node-a"), CallOutcome::Success)
        .await
        .unwrap();
    assert_eq!(ep.circuit_state(), CircuitState::Closed);
    assert_eq!(ep.breaker().unwrap().counters(), (0, 0));
}

#[tokio::test]
async fn test_explicit_disable_skips_local() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        true,
        CircuitBreakerConfig::default(),
    );
    registry
        .register_local_service(
            ServiceDefinition::new("users")
                .with_action(ActionSchema::new("find").with_handler(Arc::new(Echo))),
        )
        .await
        .unwrap();
    registry
        .process_node_info(remote_info("node-b", 1, "users", &["find"]))
        .await
        .unwrap();

    registry
        .set_endpoint_state("users.find", &node("node-a"), false)
        .await
        .unwrap();
    for _ in 0..5 {
        let ep = registry
            .next_action_endpoint("users.find", None, None)
            .await
            .unwrap();
        assert_eq!(ep.node_id(), &node("node-b"));
    }

    registry
        .set_endpoint_state("users.find", &node("node-b"), false)
        .await
        .unwrap();
    let err = registry
        .next_action_endpoint("users.find", None, None)
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::service_not_available("users.find", None));

    let err = registry
        .next_action_endpoint("orders.list", None, None)
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::service_not_found("orders.list", None));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn test_idempotent_info_application() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    let mut events = registry.subscribe();
    let info = remote_info("node-b", 3, "users", &["find", "create"]);

    let first = registry.process_node_info(info.clone()).await.unwrap();
    assert_eq!(first, NodeInfoOutcome::Connected);
    let nodes_before = registry.get_node_list(ListOptions::default()).await;
    let actions_before = registry
        .get_action_list(ListOptions {
            with_endpoints: true,
            ..Default::default()
        })
        .await;

    let second = registry.process_node_info(info).await.unwrap();
    assert_eq!(second, NodeInfoOutcome::Unchanged);
    assert_eq!(registry.get_node_list(ListOptions::default()).await, nodes_before);
    assert_eq!(
        registry
            .get_action_list(ListOptions {
                with_endpoints: true,
                ..Default::default()
            })
            .await,
        actions_before
    );

    let mut connected = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::NodeConnected { reconnected, .. } => {
                assert!(!reconnected);
                connected += 1;
            }
            RegistryEvent::NodeUpdated { .. } => panic!("duplicate INFO produced an update"),
            _ => {}
        }
    }
    assert_eq!(connected, 1);
}

#[tokio::test]
async fn test_newer_info_without_service_changes_is_an_update() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(clock.clone(), false, CircuitBreakerConfig::default());
    registry
        .process_node_info(remote_info("node-b", 1, "users", &["find"]))
        .await
        .unwrap();

    let mut events = registry.subscribe();
    clock.advance_ms(100);
    let mut info = remote_info("node-b", 2, "users", &["find"]);
    info.metadata = json!({ "region": "eu" });
    let outcome = registry.process_node_info(info).await.unwrap();
    assert_eq!(outcome, NodeInfoOutcome::Updated);

    let mut updated = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::NodeUpdated { node_id } => {
                assert_eq!(node_id, node("node-b"));
                updated += 1;
            }
            RegistryEvent::ServicesChanged { .. } => panic!("services did not change"),
            _ => {}
        }
    }
    assert_eq!(updated, 1);

    let nodes = registry.get_node_list(ListOptions::default()).await;
    let b = nodes.iter().find(|n| n.id == "node-b").unwrap();
    assert_eq!(b.metadata["region"], "eu");
    assert_eq!(b.seq, 2);
    assert_eq!(b.last_heartbeat_ms, 100);
    assert!(registry
        .next_action_endpoint("users.find", None, None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_late_version_qualifies_local_actions() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    registry
        .register_local_service(
            ServiceDefinition::new("users")
                .with_action(ActionSchema::new("find").with_handler(Arc::new(Echo)))
                .with_version(ServiceVersion::Number(2)),
        )
        .await
        .unwrap();

    assert!(registry
        .next_action_endpoint("v2.users.find", None, None)
        .await
        .is_ok());
    let err = registry
        .next_action_endpoint("users.find", None, None)
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::service_not_found("users.find", None));
}

#[tokio::test]
async fn test_failure_detector_spares_local_node() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(clock.clone(), false, CircuitBreakerConfig::default());
    registry
        .process_node_info(remote_info("node-b", 1, "users", &["find"]))
        .await
        .unwrap();
    registry
        .process_node_info(remote_info("node-c", 1, "users", &["find"]))
        .await
        .unwrap();

    clock.advance_ms(HEARTBEAT_TIMEOUT_MS / 2);
    let beat = meshwork_registry::HeartbeatPayload {
        sender: node("node-c"),
        cpu: None,
        seq: 1,
        instance_id: "inst-node-c".into(),
    };
    registry.heartbeat_received(&beat).await;

    // node-b is now 1.5x the timeout behind, node-c only 1x
    clock.advance_ms(HEARTBEAT_TIMEOUT_MS);
    let disconnected = registry.check_remote_nodes(HEARTBEAT_TIMEOUT_MS).await;
    assert_eq!(disconnected, vec![node("node-b")]);

    // The local node never heartbeats to itself and is still never touched
    clock.advance_ms(HEARTBEAT_TIMEOUT_MS * 10);
    let disconnected = registry.check_remote_nodes(HEARTBEAT_TIMEOUT_MS).await;
    assert_eq!(disconnected, vec![node("node-c")]);

    let online = registry
        .get_node_list(ListOptions {
            only_available: true,
            ..Default::default()
        })
        .await;
    assert_eq!(online.len(), 1);
    assert!(online[0].local);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(clock.clone(), false, CircuitBreakerConfig::default());
    let info = remote_info("node-b", 1, "users", &["find"]);
    registry.process_node_info(info.clone()).await.unwrap();
    assert!(registry.node_disconnected(&node("node-b"), true).await);

    let mut events = registry.subscribe();
    let outcome = registry.process_node_info(info).await.unwrap();
    assert_eq!(outcome, NodeInfoOutcome::Reconnected);
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::NodeConnected {
            node_id: node("node-b"),
            reconnected: true
        }
    );
    assert!(registry
        .next_action_endpoint("users.find", None, None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_emit_local_services_runs_all_groups_and_surfaces_failure() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    for (service, fail_with) in [("mailer", None), ("audit", Some("audit down")), ("search", None)] {
        let handler = Arc::new(Counting {
            calls: calls.clone(),
            fail_with,
        });
        registry
            .register_local_service(
                ServiceDefinition::new(service)
                    .with_event(EventSchema::new("user.*").with_handler(handler)),
            )
            .await
            .unwrap();
    }

    let err = registry
        .emit_local_services(EventContext::emit("user.created", json!({ "id": 1 })))
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        err,
        RegistryError::EmitFailed {
            first: "audit down".into(),
            failed: 1,
            total: 3
        }
    );

    // Restricting groups skips the failing one
    let ctx = EventContext::emit("user.created", Value::Null)
        .with_groups(vec!["mailer".into(), "search".into()]);
    registry.emit_local_services(ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Nothing subscribed: nothing to do
    registry
        .broadcast_local("order.placed", Value::Null)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_endpoint_uniqueness_under_repeated_announces() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    for seq in 1..=5 {
        for sender in ["node-b", "node-c", "node-b"] {
            let actions: &[&str] = if seq % 2 == 0 { &["find", "get"] } else { &["find"] };
            registry
                .process_node_info(remote_info(sender, seq, "users", actions))
                .await
                .unwrap();
        }
    }

    let endpoints = registry.action_endpoints("users.find").await;
    let unique: HashSet<&str> = endpoints.iter().map(|ep| ep.node_id().as_str()).collect();
    assert_eq!(endpoints.len(), unique.len());
    assert_eq!(endpoints.len(), 2);

    // The last announce (odd seq) dropped `get`
    let err = registry
        .next_action_endpoint("users.get", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_protected_actions_stay_local() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    registry
        .register_local_service(
            ServiceDefinition::new("billing").with_action(
                ActionSchema::new("charge")
                    .with_visibility(meshwork_registry::Visibility::Protected)
                    .with_handler(Arc::new(Echo)),
            ),
        )
        .await
        .unwrap();
    assert!(registry
        .next_action_endpoint("billing.charge", None, None)
        .await
        .is_ok());

    let mut info = NodeInfo::new(node("node-b"), "inst-b".into());
    info.services = vec![ServiceDefinition::new("vault")
        .with_action(
            ActionSchema::new("open").with_visibility(meshwork_registry::Visibility::Protected),
        )
        .to_info()];
    registry.process_node_info(info).await.unwrap();

    let err = registry
        .next_action_endpoint("vault.open", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_introspection_lists() {
    let registry = registry(
        Arc::new(ManualClock::new(0)),
        false,
        CircuitBreakerConfig::default(),
    );
    registry
        .register_local_service(
            ServiceDefinition::new("$node")
                .with_action(ActionSchema::new("list").with_handler(Arc::new(Echo))),
        )
        .await
        .unwrap();
    registry
        .process_node_info(remote_info("node-b", 1, "users", &["find"]))
        .await
        .unwrap();

    let all = registry.get_action_list(ListOptions::default()).await;
    assert_eq!(all.len(), 2);

    let public = registry
        .get_action_list(ListOptions {
            skip_internal: true,
            ..Default::default()
        })
        .await;
    assert_eq!(public.len(), 1);
    assert_eq!(public[0].name, "users.find");

    let local_services = registry
        .get_service_list(ListOptions {
            only_local: true,
            with_actions: true,
            ..Default::default()
        })
        .await;
    assert_eq!(local_services.len(), 1);
    assert_eq!(
        local_services[0].actions.as_deref(),
        Some(&["$node.list".to_string()][..])
    );

    let record = serde_json::to_value(&all[0]).unwrap();
    assert!(record.get("hasLocal").is_some());
}
