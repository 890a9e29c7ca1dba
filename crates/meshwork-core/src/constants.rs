//! TigerStyle constants for meshwork
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Protocol
// =============================================================================

/// Version carried in every INFO packet; mismatching nodes are not admitted
pub const PROTOCOL_VERSION: &str = "4";

/// Names starting with this prefix are cluster control-plane internals
pub const INTERNAL_NAME_PREFIX: &str = "$";

/// Maximum length of a node ID in bytes
pub const NODE_ID_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an action or event name in bytes
pub const NAME_LENGTH_BYTES_MAX: usize = 512;

// =============================================================================
// Discovery / Heartbeat
// =============================================================================

/// Interval between heartbeats in milliseconds (10 sec)
pub const HEARTBEAT_INTERVAL_MS_DEFAULT: u64 = 10 * 1000;

/// Staleness after which a remote node is considered gone (30 sec)
pub const HEARTBEAT_TIMEOUT_MS_DEFAULT: u64 = 30 * 1000;

/// Smallest heartbeat interval accepted by configuration (10 ms)
pub const HEARTBEAT_INTERVAL_MS_MIN: u64 = 10;

/// Random jitter applied to each heartbeat tick (+/- 500 ms)
pub const HEARTBEAT_JITTER_MS_MAX: u64 = 500;

/// Offline nodes are forgotten after this long (10 min)
pub const CLEAN_OFFLINE_NODES_TIMEOUT_MS_DEFAULT: u64 = 10 * 60 * 1000;

/// Remote liveness check runs every `interval * N`
pub const CHECK_REMOTE_NODES_INTERVAL_MULTIPLIER: u64 = 2;

/// Offline cleanup runs every `interval * N`
pub const CHECK_OFFLINE_NODES_INTERVAL_MULTIPLIER: u64 = 3;

/// Heartbeat key TTL is `interval * N`
pub const KV_BEAT_TTL_INTERVAL_MULTIPLIER: u64 = 3;

/// INFO key TTL in seconds (1 hour)
pub const KV_INFO_TTL_SECS_DEFAULT: u64 = 60 * 60;

/// Every N-th collection fetches full heartbeat values instead of parsing keys
pub const KV_FULL_CHECK_COUNT_DEFAULT: u64 = 10;

/// SCAN page size for stores that page their key listing
pub const KV_SCAN_LENGTH_COUNT_DEFAULT: usize = 100;

/// Length of the instance-id hash embedded in heartbeat keys
pub const KV_INSTANCE_HASH_LENGTH_BYTES: usize = 8;

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Failure ratio that trips the breaker
pub const CIRCUIT_BREAKER_THRESHOLD_DEFAULT: f64 = 0.5;

/// Length of the rolling failure/pass window in milliseconds (60 sec)
pub const CIRCUIT_BREAKER_WINDOW_MS_DEFAULT: u64 = 60 * 1000;

/// Samples required before the ratio is evaluated
pub const CIRCUIT_BREAKER_MIN_REQUEST_COUNT_DEFAULT: u64 = 20;

/// Time spent OPEN before a trial call is allowed (10 sec)
pub const CIRCUIT_BREAKER_HALF_OPEN_MS_DEFAULT: u64 = 10 * 1000;

/// Error codes at or above this value count as server-class failures
pub const CIRCUIT_BREAKER_REJECT_CODE_MIN: u16 = 500;

// =============================================================================
// Strategies
// =============================================================================

/// Candidates sampled by the CPU-usage strategy
pub const STRATEGY_CPU_SAMPLE_COUNT_DEFAULT: usize = 3;

/// CPU usage (percent) considered low enough to pick immediately
pub const STRATEGY_CPU_LOW_USAGE_PERCENT_DEFAULT: f64 = 10.0;

/// Candidates sampled by the latency strategy
pub const STRATEGY_LATENCY_SAMPLE_COUNT_DEFAULT: usize = 5;

/// Latency considered low enough to pick immediately (10 ms)
pub const STRATEGY_LATENCY_LOW_MS_DEFAULT: f64 = 10.0;

/// Samples in the rolling latency average
pub const STRATEGY_LATENCY_COLLECT_COUNT_DEFAULT: usize = 5;

/// Interval between latency probes in milliseconds (10 sec)
pub const STRATEGY_LATENCY_PING_INTERVAL_MS_DEFAULT: u64 = 10 * 1000;

/// Virtual nodes per real node on the consistent-hash ring
pub const STRATEGY_SHARD_VNODES_COUNT_DEFAULT: usize = 10;

/// Size of the consistent-hash ring (2^31 - 1)
pub const STRATEGY_SHARD_RING_SIZE_DEFAULT: u64 = 2_147_483_647;

/// Resolved keys cached between ring rebuilds
pub const STRATEGY_SHARD_CACHE_COUNT_DEFAULT: usize = 1000;

// =============================================================================
// Registry
// =============================================================================

/// Capacity of the registry lifecycle event channel
pub const REGISTRY_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum number of nodes tracked by one registry
pub const REGISTRY_NODES_COUNT_MAX: usize = 10_000;

// =============================================================================
// Observability - Metric Names (TigerStyle: explicit, with units)
// =============================================================================

/// Metric: Circuit breaker transitions (counter, labels: action, node, state)
pub const METRIC_NAME_CIRCUIT_BREAKER_TRANSITIONS_TOTAL: &str =
    "meshwork_circuit_breaker_transitions_total";

/// Metric: Node connections (counter, labels: reconnected)
pub const METRIC_NAME_NODES_CONNECTED_TOTAL: &str = "meshwork_nodes_connected_total";

/// Metric: Node disconnections (counter, labels: unexpected)
pub const METRIC_NAME_NODES_DISCONNECTED_TOTAL: &str = "meshwork_nodes_disconnected_total";

/// Metric: Endpoint resolution failures (counter, labels: action, reason)
pub const METRIC_NAME_ENDPOINT_UNAVAILABLE_TOTAL: &str = "meshwork_endpoint_unavailable_total";

/// Metric: Heartbeats sent by the local node (counter)
pub const METRIC_NAME_HEARTBEATS_SENT_TOTAL: &str = "meshwork_heartbeats_sent_total";

// Compile-time assertions for constant validity
const _: () = {
    assert!(HEARTBEAT_TIMEOUT_MS_DEFAULT > HEARTBEAT_INTERVAL_MS_DEFAULT);
    assert!(CLEAN_OFFLINE_NODES_TIMEOUT_MS_DEFAULT > HEARTBEAT_TIMEOUT_MS_DEFAULT);
    assert!(HEARTBEAT_JITTER_MS_MAX < HEARTBEAT_INTERVAL_MS_DEFAULT);
    assert!(KV_BEAT_TTL_INTERVAL_MULTIPLIER >= 2);
    assert!(STRATEGY_SHARD_RING_SIZE_DEFAULT <= u32::MAX as u64);
    assert!(STRATEGY_SHARD_VNODES_COUNT_DEFAULT >= 1);
    assert!(CIRCUIT_BREAKER_REJECT_CODE_MIN >= 500);
};
