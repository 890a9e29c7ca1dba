//! Meshwork Core
//!
//! Core types, configuration, and I/O abstractions for the meshwork
//! service runtime.
//!
//! # Overview
//!
//! Meshwork resolves logical action and event names to live endpoints spread
//! across a cluster of nodes that join, leave, and crash without coordination.
//! This crate holds what every other crate shares: limits and defaults,
//! configuration with validation, the time/randomness abstraction used for
//! all liveness arithmetic, and logging/metrics setup.
//!
//! # TigerStyle
//!
//! - Explicit limits with big-endian naming (e.g., `HEARTBEAT_TIMEOUT_MS_DEFAULT`)
//! - All time goes through [`TimeProvider`]
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod metrics;
pub mod telemetry;

pub use config::{
    BackendConfig, CircuitBreakerConfig, CpuUsageOptions, DiscovererConfig, Etcd3Options,
    LatencyOptions, MeshConfig, RedisOptions, RegistryConfig, SerializerKind, ShardOptions,
    StrategyConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{IoContext, ManualClock, RngProvider, StdRngProvider, TimeProvider, WallClockTime};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
