//! Metrics collection for meshwork
//!
//! TigerStyle: Explicit metric names with units, type-safe recording.
//!
//! Instruments are exported via Prometheus when the `otel` feature is enabled;
//! otherwise every recording function is a no-op.

#[cfg(feature = "otel")]
use crate::constants::*;
#[cfg(feature = "otel")]
use once_cell::sync::Lazy;
#[cfg(feature = "otel")]
use opentelemetry::metrics::Counter;
#[cfg(feature = "otel")]
use opentelemetry::{global, KeyValue};

#[cfg(feature = "otel")]
static CIRCUIT_BREAKER_TRANSITIONS_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("meshwork")
        .u64_counter(METRIC_NAME_CIRCUIT_BREAKER_TRANSITIONS_TOTAL)
        .with_description("Total circuit breaker state transitions")
        .init()
});

#[cfg(feature = "otel")]
static NODES_CONNECTED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("meshwork")
        .u64_counter(METRIC_NAME_NODES_CONNECTED_TOTAL)
        .with_description("Total remote node connections")
        .init()
});

#[cfg(feature = "otel")]
static NODES_DISCONNECTED_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("meshwork")
        .u64_counter(METRIC_NAME_NODES_DISCONNECTED_TOTAL)
        .with_description("Total remote node disconnections")
        .init()
});

#[cfg(feature = "otel")]
static ENDPOINT_UNAVAILABLE_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("meshwork")
        .u64_counter(METRIC_NAME_ENDPOINT_UNAVAILABLE_TOTAL)
        .with_description("Total failed endpoint resolutions")
        .init()
});

#[cfg(feature = "otel")]
static HEARTBEATS_SENT_COUNTER: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("meshwork")
        .u64_counter(METRIC_NAME_HEARTBEATS_SENT_TOTAL)
        .with_description("Total heartbeats sent by this node")
        .init()
});

/// Record a circuit breaker transition
///
/// # Arguments
/// * `action` - Action name guarded by the breaker
/// * `node_id` - Node owning the endpoint
/// * `state` - New state: "open", "half_open" or "closed"
#[cfg(feature = "otel")]
pub fn record_circuit_breaker_transition(action: &str, node_id: &str, state: &str) {
    CIRCUIT_BREAKER_TRANSITIONS_COUNTER.add(
        1,
        &[
            KeyValue::new("action", action.to_string()),
            KeyValue::new("node", node_id.to_string()),
            KeyValue::new("state", state.to_string()),
        ],
    );
}

/// Record a remote node connecting
#[cfg(feature = "otel")]
pub fn record_node_connected(reconnected: bool) {
    NODES_CONNECTED_COUNTER.add(1, &[KeyValue::new("reconnected", reconnected)]);
}

/// Record a remote node disconnecting
#[cfg(feature = "otel")]
pub fn record_node_disconnected(unexpected: bool) {
    NODES_DISCONNECTED_COUNTER.add(1, &[KeyValue::new("unexpected", unexpected)]);
}

/// Record a failed endpoint resolution
///
/// # Arguments
/// * `action` - Requested action name
/// * `reason` - "not_found" or "not_available"
#[cfg(feature = "otel")]
pub fn record_endpoint_unavailable(action: &str, reason: &str) {
    ENDPOINT_UNAVAILABLE_COUNTER.add(
        1,
        &[
            KeyValue::new("action", action.to_string()),
            KeyValue::new("reason", reason.to_string()),
        ],
    );
}

/// Record a heartbeat sent by the local node
#[cfg(feature = "otel")]
pub fn record_heartbeat_sent() {
    HEARTBEATS_SENT_COUNTER.add(1, &[]);
}

// No-op implementations when otel feature is disabled
#[cfg(not(feature = "otel"))]
pub fn record_circuit_breaker_transition(_action: &str, _node_id: &str, _state: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_node_connected(_reconnected: bool) {}

#[cfg(not(feature = "otel"))]
pub fn record_node_disconnected(_unexpected: bool) {}

#[cfg(not(feature = "otel"))]
pub fn record_endpoint_unavailable(_action: &str, _reason: &str) {}

#[cfg(not(feature = "otel"))]
pub fn record_heartbeat_sent() {}
