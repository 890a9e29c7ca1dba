//! Registry lifecycle notifications
//!
//! Delivered over a `tokio::sync::broadcast` channel. Slow subscribers lag
//! and lose old notifications; they never block the registry.

use crate::node::NodeId;

/// A lifecycle change observed by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A remote node announced itself for the first time, or came back
    NodeConnected { node_id: NodeId, reconnected: bool },
    /// A known node re-announced with changed content
    NodeUpdated { node_id: NodeId },
    /// A node went offline; `unexpected` when detected by heartbeat timeout
    NodeDisconnected { node_id: NodeId, unexpected: bool },
    /// A long-offline node was forgotten
    NodeRemoved { node_id: NodeId },
    /// The service set changed; `local` when it was the local node's
    ServicesChanged { local: bool },
    CircuitBreakerOpened {
        action: String,
        node_id: NodeId,
        failures: u64,
        passes: u64,
        rate: f64,
    },
    CircuitBreakerHalfOpened { action: String, node_id: NodeId },
    CircuitBreakerClosed { action: String, node_id: NodeId },
}
