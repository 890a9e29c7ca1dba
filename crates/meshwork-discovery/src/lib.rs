//! Meshwork Discovery
//!
//! Node discovery, heartbeats, and failure detection.
//!
//! # Overview
//!
//! A [`Discoverer`] drives the registry's view of the cluster. It owns the
//! timers every discovery mechanism needs (heartbeats, remote liveness
//! checks, offline cleanup) and delegates the wire details to a
//! [`DiscoveryBackend`]:
//!
//! - [`LocalBackend`]: DISCOVER/INFO/HEARTBEAT/DISCONNECT over the transport
//! - [`KvBackend`]: heartbeat and INFO keys with TTLs in a shared store
//!   (etcd v3 behind `etcd3`, Redis behind `redis`, in-memory for tests)
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = MemoryBus::new();
//! let transport = Arc::new(MemoryTransport::new(bus, node_id, Serializer::default()));
//! let discoverer = Discoverer::from_config(&config, registry, Some(transport)).await?;
//! discoverer.start().await?;
//! ```

pub mod cpu;
pub mod discoverer;
pub mod error;
#[cfg(feature = "etcd3")]
pub mod etcd3;
pub mod kv;
pub mod local;
pub mod packet;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod transport;

pub use cpu::{CpuSampler, FixedCpuSampler, SysinfoCpuSampler};
pub use discoverer::{create_backend, kv_backend, Discoverer, DiscoveryBackend};
pub use error::{DiscoveryError, DiscoveryResult};
pub use kv::{KvBackend, KvKeys, KvStore, MemoryKvStore};
pub use local::LocalBackend;
pub use packet::{Packet, PacketBody, PacketType, Serializer};
pub use transport::{MemoryBus, MemoryTransport, PacketHandler, Transport};
