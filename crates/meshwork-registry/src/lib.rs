//! Meshwork Registry
//!
//! Service registry and endpoint selection for meshwork nodes.
//!
//! # Overview
//!
//! The registry provides:
//! - Node, service, action, and event catalogs
//! - Endpoint lists with pluggable balancing strategies
//!   (round robin, random, CPU usage, latency, consistent hashing)
//! - Per-endpoint circuit breakers
//! - INFO and heartbeat payloads exchanged by discoverers
//! - Lifecycle notifications over a broadcast channel
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Registry::builder().build();
//! registry.register_local_service(
//!     ServiceDefinition::new("users").with_action(ActionSchema::new("find").with_handler(handler)),
//! ).await?;
//! let endpoint = registry.next_action_endpoint("users.find", Some(&ctx), None).await?;
//! ```

pub mod action_catalog;
pub mod circuit_breaker;
pub mod context;
pub mod endpoint;
pub mod endpoint_list;
pub mod error;
pub mod event_catalog;
pub mod events;
pub mod handler;
pub mod introspection;
pub mod node;
pub mod node_catalog;
pub mod packet;
pub mod registry;
pub mod schema;
pub mod service;
pub mod service_catalog;
pub mod strategies;

pub use action_catalog::{ActionCatalog, CatalogSettings};
pub use circuit_breaker::{CallOutcome, CircuitBreaker, CircuitState};
pub use context::{Context, EventContext};
pub use endpoint::{ActionEndpoint, Endpoint, EventEndpoint};
pub use endpoint_list::EndpointList;
pub use error::{RegistryError, RegistryResult};
pub use event_catalog::{match_event, EventCatalog};
pub use events::RegistryEvent;
pub use handler::{ActionHandler, EventHandler, HandlerError};
pub use introspection::{
    ActionRecord, EndpointRecord, EventRecord, ListOptions, NodeRecord, ServiceRecord,
};
pub use node::{Node, NodeId, NodeUpdate};
pub use node_catalog::{NodeCatalog, NodeInfoOutcome, ProcessedInfo};
pub use packet::{ActionInfo, ClientInfo, EventInfo, HeartbeatPayload, NodeInfo, ServiceInfo};
pub use registry::{HeartbeatStatus, Registry, RegistryBuilder};
pub use schema::{ActionSchema, EventSchema, ServiceDefinition, Visibility};
pub use service::{service_full_name, ServiceItem, ServiceVersion};
pub use service_catalog::ServiceCatalog;
pub use strategies::{
    create_strategy, LatencyProber, Pinger, ProbeTargets, ProberRole, SelectionContext, ShardFactory,
    ShardKeyFn, Strategy, StrategyDeps, StrategyFactory, StrategySpec,
};
