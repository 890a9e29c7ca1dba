//! Configuration for meshwork
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.
//!
//! Loading from files or CLI flags is left to the host process; these types
//! are built programmatically or deserialized from whatever the host reads.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for a meshwork node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier (auto-generated if not specified)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Namespace isolating independent meshes sharing a store
    #[serde(default)]
    pub namespace: Option<String>,

    /// Endpoint selection configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Discovery and heartbeat configuration
    #[serde(default)]
    pub discoverer: DiscovererConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Record metrics for registry lifecycle events
    #[serde(default)]
    pub metrics_enabled: bool,
}

impl MeshConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref id) = self.node_id {
            if id.is_empty() || id.len() > NODE_ID_LENGTH_BYTES_MAX {
                return Err(Error::invalid_config(
                    "node_id",
                    format!("length must be in 1..={}", NODE_ID_LENGTH_BYTES_MAX),
                ));
            }
        }
        self.registry.validate()?;
        self.discoverer.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }

    /// Configuration with short intervals for tests
    pub fn for_testing() -> Self {
        Self {
            node_id: Some("test-node".into()),
            namespace: None,
            registry: RegistryConfig::default(),
            discoverer: DiscovererConfig::for_testing(),
            circuit_breaker: CircuitBreakerConfig::default(),
            metrics_enabled: false,
        }
    }
}

// =============================================================================
// Registry / Strategy
// =============================================================================

/// Endpoint selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Default balancing strategy for actions and event groups
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Prefer the local endpoint when it is available
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,
}

fn default_prefer_local() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            prefer_local: default_prefer_local(),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Result<()> {
        self.strategy.validate("registry.strategy")
    }
}

/// Built-in balancing strategies and their options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Cycle through endpoints in order
    RoundRobin,
    /// Uniform random pick
    Random,
    /// Prefer nodes reporting low CPU usage
    CpuUsage(CpuUsageOptions),
    /// Prefer hosts with low measured latency
    Latency(LatencyOptions),
    /// Consistent hashing on a key taken from the call
    Shard(ShardOptions),
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl StrategyConfig {
    /// Strategy name as used in logs and introspection
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::CpuUsage(_) => "cpu_usage",
            Self::Latency(_) => "latency",
            Self::Shard(_) => "shard",
        }
    }

    /// Validate strategy options; `field` prefixes error paths
    pub fn validate(&self, field: &str) -> Result<()> {
        match self {
            Self::RoundRobin | Self::Random => Ok(()),
            Self::CpuUsage(opts) => {
                if opts.sample_count == 0 {
                    return Err(Error::invalid_config(
                        format!("{}.sample_count", field),
                        "must be positive",
                    ));
                }
                Ok(())
            }
            Self::Latency(opts) => {
                if opts.sample_count == 0 || opts.collect_count == 0 {
                    return Err(Error::invalid_config(
                        format!("{}.sample_count", field),
                        "sample_count and collect_count must be positive",
                    ));
                }
                if opts.ping_interval_ms == 0 {
                    return Err(Error::invalid_config(
                        format!("{}.ping_interval_ms", field),
                        "must be positive",
                    ));
                }
                Ok(())
            }
            Self::Shard(opts) => {
                if opts.vnodes == 0 {
                    return Err(Error::invalid_config(
                        format!("{}.vnodes", field),
                        "must be positive",
                    ));
                }
                if opts.ring_size == 0 || opts.ring_size > u32::MAX as u64 {
                    return Err(Error::invalid_config(
                        format!("{}.ring_size", field),
                        format!("must be in 1..={}", u32::MAX),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Options for the CPU-usage strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuUsageOptions {
    #[serde(default = "default_cpu_sample_count")]
    pub sample_count: usize,
    /// Percent; any sampled node below this is picked immediately
    #[serde(default = "default_low_cpu_usage")]
    pub low_cpu_usage: f64,
}

fn default_cpu_sample_count() -> usize {
    STRATEGY_CPU_SAMPLE_COUNT_DEFAULT
}

fn default_low_cpu_usage() -> f64 {
    STRATEGY_CPU_LOW_USAGE_PERCENT_DEFAULT
}

impl Default for CpuUsageOptions {
    fn default() -> Self {
        Self {
            sample_count: default_cpu_sample_count(),
            low_cpu_usage: default_low_cpu_usage(),
        }
    }
}

/// Options for the latency strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyOptions {
    #[serde(default = "default_latency_sample_count")]
    pub sample_count: usize,
    #[serde(default = "default_low_latency_ms")]
    pub low_latency_ms: f64,
    /// Samples in the rolling per-host average
    #[serde(default = "default_collect_count")]
    pub collect_count: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

fn default_latency_sample_count() -> usize {
    STRATEGY_LATENCY_SAMPLE_COUNT_DEFAULT
}

fn default_low_latency_ms() -> f64 {
    STRATEGY_LATENCY_LOW_MS_DEFAULT
}

fn default_collect_count() -> usize {
    STRATEGY_LATENCY_COLLECT_COUNT_DEFAULT
}

fn default_ping_interval_ms() -> u64 {
    STRATEGY_LATENCY_PING_INTERVAL_MS_DEFAULT
}

impl Default for LatencyOptions {
    fn default() -> Self {
        Self {
            sample_count: default_latency_sample_count(),
            low_latency_ms: default_low_latency_ms(),
            collect_count: default_collect_count(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

/// Options for the consistent-hashing strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardOptions {
    /// Dotted param path, or `#`-prefixed meta path
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_vnodes")]
    pub vnodes: usize,
    #[serde(default = "default_ring_size")]
    pub ring_size: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_vnodes() -> usize {
    STRATEGY_SHARD_VNODES_COUNT_DEFAULT
}

fn default_ring_size() -> u64 {
    STRATEGY_SHARD_RING_SIZE_DEFAULT
}

fn default_cache_size() -> usize {
    STRATEGY_SHARD_CACHE_COUNT_DEFAULT
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            key: None,
            vnodes: default_vnodes(),
            ring_size: default_ring_size(),
            cache_size: default_cache_size(),
        }
    }
}

// =============================================================================
// Discoverer
// =============================================================================

/// Value encoding for packets and KV entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    #[default]
    Json,
    Cbor,
}

/// Discovery backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Transport pub/sub only, no external store
    #[default]
    Local,
    /// etcd v3 key-value store
    Etcd3(Etcd3Options),
    /// Redis key-value store
    Redis(RedisOptions),
}

impl BackendConfig {
    /// Backend name as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Etcd3(_) => "etcd3",
            Self::Redis(_) => "redis",
        }
    }
}

/// etcd connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Etcd3Options {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_connect_timeout_ms() -> u64 {
    5 * 1000
}

impl Default for Etcd3Options {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            username: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Redis connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisOptions {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// Discovery and heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscovererConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Skip the remote staleness check entirely
    #[serde(default)]
    pub disable_heartbeat_checks: bool,

    /// Never forget offline nodes
    #[serde(default)]
    pub disable_offline_node_removing: bool,

    #[serde(default = "default_clean_offline_nodes_timeout_ms")]
    pub clean_offline_nodes_timeout_ms: u64,

    #[serde(default)]
    pub serializer: SerializerKind,

    /// Every N-th KV collection fetches full values
    #[serde(default = "default_full_check")]
    pub full_check: u64,

    #[serde(default = "default_scan_length")]
    pub scan_length: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL_MS_DEFAULT
}

fn default_heartbeat_timeout_ms() -> u64 {
    HEARTBEAT_TIMEOUT_MS_DEFAULT
}

fn default_clean_offline_nodes_timeout_ms() -> u64 {
    CLEAN_OFFLINE_NODES_TIMEOUT_MS_DEFAULT
}

fn default_full_check() -> u64 {
    KV_FULL_CHECK_COUNT_DEFAULT
}

fn default_scan_length() -> usize {
    KV_SCAN_LENGTH_COUNT_DEFAULT
}

impl Default for DiscovererConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            disable_heartbeat_checks: false,
            disable_offline_node_removing: false,
            clean_offline_nodes_timeout_ms: default_clean_offline_nodes_timeout_ms(),
            serializer: SerializerKind::default(),
            full_check: default_full_check(),
            scan_length: default_scan_length(),
        }
    }
}

impl DiscovererConfig {
    /// Short intervals for tests
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 300,
            clean_offline_nodes_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    /// TTL for heartbeat keys in whole seconds (at least one)
    pub fn beat_ttl_secs(&self) -> u64 {
        let ttl_ms = self.heartbeat_interval_ms * KV_BEAT_TTL_INTERVAL_MULTIPLIER;
        ttl_ms.div_ceil(1000).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms < HEARTBEAT_INTERVAL_MS_MIN {
            return Err(Error::invalid_config(
                "discoverer.heartbeat_interval_ms",
                format!("must be at least {}", HEARTBEAT_INTERVAL_MS_MIN),
            ));
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::invalid_config(
                "discoverer.heartbeat_timeout_ms",
                "must be greater than heartbeat_interval_ms",
            ));
        }

        if self.full_check == 0 {
            return Err(Error::invalid_config(
                "discoverer.full_check",
                "must be positive",
            ));
        }

        if self.scan_length == 0 {
            return Err(Error::invalid_config(
                "discoverer.scan_length",
                "must be positive",
            ));
        }

        if let BackendConfig::Etcd3(ref opts) = self.backend {
            if opts.endpoints.is_empty() {
                return Err(Error::invalid_config(
                    "discoverer.backend.endpoints",
                    "at least one endpoint is required",
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Per-endpoint circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Failure ratio in (0, 1] that trips the breaker
    #[serde(default = "default_cb_threshold")]
    pub threshold: f64,

    #[serde(default = "default_cb_window_ms")]
    pub window_time_ms: u64,

    #[serde(default = "default_cb_min_request_count")]
    pub min_request_count: u64,

    #[serde(default = "default_cb_half_open_ms")]
    pub half_open_time_ms: u64,

    #[serde(default = "default_true")]
    pub failure_on_timeout: bool,

    #[serde(default = "default_true")]
    pub failure_on_reject: bool,
}

fn default_cb_threshold() -> f64 {
    CIRCUIT_BREAKER_THRESHOLD_DEFAULT
}

fn default_cb_window_ms() -> u64 {
    CIRCUIT_BREAKER_WINDOW_MS_DEFAULT
}

fn default_cb_min_request_count() -> u64 {
    CIRCUIT_BREAKER_MIN_REQUEST_COUNT_DEFAULT
}

fn default_cb_half_open_ms() -> u64 {
    CIRCUIT_BREAKER_HALF_OPEN_MS_DEFAULT
}

fn default_true() -> bool {
    true
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_cb_threshold(),
            window_time_ms: default_cb_window_ms(),
            min_request_count: default_cb_min_request_count(),
            half_open_time_ms: default_cb_half_open_ms(),
            failure_on_timeout: true,
            failure_on_reject: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Enabled breaker with default thresholds
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::invalid_config(
                "circuit_breaker.threshold",
                format!("{} is not in (0, 1]", self.threshold),
            ));
        }

        if self.window_time_ms == 0 || self.half_open_time_ms == 0 {
            return Err(Error::invalid_config(
                "circuit_breaker.window_time_ms",
                "window_time_ms and half_open_time_ms must be positive",
            ));
        }

        Ok(())
    }
}
