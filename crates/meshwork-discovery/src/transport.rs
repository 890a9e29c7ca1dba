//! Packet transport contract and the in-process bus
//!
//! TigerStyle: The discoverer never sees sockets or framing, only
//! `(packet type, raw bytes)` pairs handed to its [`PacketHandler`].

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::packet::{Packet, PacketType, Serializer};
use async_trait::async_trait;
use bytes::Bytes;
use meshwork_registry::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Capacity of each node's inbound queue on the memory bus
const MEMORY_BUS_QUEUE_COUNT_MAX: usize = 1000;

/// Receives decoded-type, still-encoded packets
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Must not fail: a bad packet is logged and dropped by the handler
    async fn on_packet(&self, packet_type: PacketType, raw: Bytes);
}

/// Pub/sub transport used by the local discovery backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering inbound packets to `handler`
    async fn connect(&self, handler: Arc<dyn PacketHandler>) -> DiscoveryResult<()>;

    /// Stop delivering and leave the bus
    async fn disconnect(&self) -> DiscoveryResult<()>;

    /// Encode and send; a broadcast never loops back to the sender
    async fn publish(&self, packet: Packet) -> DiscoveryResult<()>;

    fn serializer(&self) -> Serializer;
}

// =============================================================================
// Memory bus
// =============================================================================

type Inbox = mpsc::Sender<(PacketType, Bytes)>;

/// Shared medium connecting [`MemoryTransport`]s in one process
#[derive(Default)]
pub struct MemoryBus {
    inboxes: RwLock<HashMap<NodeId, Inbox>>,
    /// Nodes cut off from everyone, in both directions
    partitioned: RwLock<HashSet<NodeId>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop all traffic to and from `node_id`
    pub async fn partition(&self, node_id: &NodeId) {
        self.partitioned.write().await.insert(node_id.clone());
    }

    pub async fn heal(&self, node_id: &NodeId) {
        self.partitioned.write().await.remove(node_id);
    }

    pub async fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inboxes.read().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    async fn deliver(
        &self,
        from: &NodeId,
        target: Option<&NodeId>,
        packet_type: PacketType,
        raw: Bytes,
    ) -> DiscoveryResult<()> {
        let partitioned = self.partitioned.read().await.clone();
        if partitioned.contains(from) {
            trace!(node_id = %from, packet = %packet_type, "Sender partitioned, dropping");
            return Ok(());
        }

        // Clone the senders so no lock is held across a send
        let recipients: Vec<(NodeId, Inbox)> = {
            let inboxes = self.inboxes.read().await;
            match target {
                Some(target) => {
                    let inbox = inboxes.get(target).ok_or_else(|| {
                        DiscoveryError::transport(target, "node not connected to bus")
                    })?;
                    vec![(target.clone(), inbox.clone())]
                }
                None => inboxes
                    .iter()
                    .filter(|(id, _)| *id != from)
                    .map(|(id, inbox)| (id.clone(), inbox.clone()))
                    .collect(),
            }
        };

        for (node_id, inbox) in recipients {
            if partitioned.contains(&node_id) {
                continue;
            }
            if inbox.send((packet_type, raw.clone())).await.is_err() {
                debug!(node_id = %node_id, packet = %packet_type, "Receiver gone, dropping packet");
            }
        }
        Ok(())
    }
}

/// Transport over a [`MemoryBus`]
pub struct MemoryTransport {
    node_id: NodeId,
    bus: Arc<MemoryBus>,
    serializer: Serializer,
    receiver: RwLock<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(bus: Arc<MemoryBus>, node_id: NodeId, serializer: Serializer) -> Self {
        Self {
            node_id,
            bus,
            serializer,
            receiver: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, handler: Arc<dyn PacketHandler>) -> DiscoveryResult<()> {
        let mut receiver = self.receiver.write().await;
        if receiver.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::channel::<(PacketType, Bytes)>(MEMORY_BUS_QUEUE_COUNT_MAX);
        self.bus
            .inboxes
            .write()
            .await
            .insert(self.node_id.clone(), tx);

        let node_id = self.node_id.clone();
        *receiver = Some(tokio::spawn(async move {
            while let Some((packet_type, raw)) = rx.recv().await {
                handler.on_packet(packet_type, raw).await;
            }
            debug!(node_id = %node_id, "Memory transport receiver stopped");
        }));
        Ok(())
    }

    async fn disconnect(&self) -> DiscoveryResult<()> {
        // Removing the inbox closes the channel and ends the receive loop
        self.bus.inboxes.write().await.remove(&self.node_id);
        if let Some(task) = self.receiver.write().await.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn publish(&self, packet: Packet) -> DiscoveryResult<()> {
        let packet_type = packet.packet_type();
        let raw = self.serializer.encode(&packet.body)?;
        self.bus
            .deliver(&self.node_id, packet.target.as_ref(), packet_type, raw)
            .await
    }

    fn serializer(&self) -> Serializer {
        self.serializer
    }
}
