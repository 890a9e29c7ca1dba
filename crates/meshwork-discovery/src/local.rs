//! Local backend: discovery over the transport's own pub/sub
//!
//! No external store. Nodes broadcast DISCOVER to learn who is out there,
//! answer DISCOVER with their INFO, broadcast HEARTBEAT on every beat, and
//! broadcast DISCONNECT when they stop cleanly.

use crate::discoverer::{apply_remote_info, DiscoveryBackend};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::packet::{Packet, PacketBody, PacketType, Serializer};
use crate::transport::{PacketHandler, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use meshwork_registry::{NodeId, Pinger, Registry, RegistryError, RegistryResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

struct PendingPing {
    sent_ms: u64,
    reply: oneshot::Sender<u64>,
}

pub struct LocalBackend {
    me: Weak<LocalBackend>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    serializer: Serializer,
    ping_timeout_ms: u64,
    pings: Mutex<HashMap<String, PendingPing>>,
}

impl LocalBackend {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        ping_timeout_ms: u64,
    ) -> Arc<Self> {
        let serializer = transport.serializer();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            transport,
            serializer,
            ping_timeout_ms,
            pings: Mutex::new(HashMap::new()),
        })
    }

    fn local_id(&self) -> &NodeId {
        self.registry.local_node_id()
    }

    async fn handle(&self, body: PacketBody) -> DiscoveryResult<()> {
        match body {
            PacketBody::Discover { sender } => self.send_local_node_info(Some(&sender)).await,
            PacketBody::Info(info) => {
                apply_remote_info(&self.registry, info).await;
                Ok(())
            }
            PacketBody::Heartbeat(beat) => self.heartbeat_received(&self.registry, &beat).await,
            PacketBody::Disconnect { sender } => {
                self.registry.node_disconnected(&sender, false).await;
                Ok(())
            }
            PacketBody::Ping { sender, id } => {
                let pong = PacketBody::Pong {
                    sender: self.local_id().clone(),
                    id,
                };
                self.transport.publish(Packet::to(sender, pong)).await
            }
            PacketBody::Pong { id, .. } => {
                let pending = self
                    .pings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                if let Some(pending) = pending {
                    let rtt_ms = self.registry.io().monotonic_ms().saturating_sub(pending.sent_ms);
                    let _ = pending.reply.send(rtt_ms);
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PacketHandler for LocalBackend {
    async fn on_packet(&self, packet_type: PacketType, raw: Bytes) {
        let body: PacketBody = match self.serializer.decode(&raw) {
            Ok(body) => body,
            Err(e) => {
                warn!(packet = %packet_type, error = %e, "Dropping undecodable packet");
                return;
            }
        };

        if body.packet_type() != packet_type {
            warn!(packet = %packet_type, body = %body.packet_type(), "Dropping mislabeled packet");
            return;
        }
        if body.sender() == self.local_id() {
            return;
        }

        trace!(packet = %packet_type, sender = %body.sender(), "Packet received");
        let sender = body.sender().clone();
        if let Err(e) = self.handle(body).await {
            warn!(packet = %packet_type, sender = %sender, error = %e, "Packet handling failed");
        }
    }
}

#[async_trait]
impl DiscoveryBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn start(&self) -> DiscoveryResult<()> {
        let handler: Arc<dyn PacketHandler> = match self.me.upgrade() {
            Some(me) => me,
            None => {
                return Err(DiscoveryError::BackendUnavailable {
                    backend: "local".into(),
                })
            }
        };
        self.transport.connect(handler).await?;
        info!(node_id = %self.local_id(), "Local discovery connected");
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        let bye = PacketBody::Disconnect {
            sender: self.local_id().clone(),
        };
        if let Err(e) = self.transport.publish(Packet::broadcast(bye)).await {
            error!(error = %e, "Failed to announce disconnect");
        }
        self.transport.disconnect().await
    }

    async fn send_heartbeat(&self) -> DiscoveryResult<()> {
        let beat = self.registry.local_heartbeat().await;
        trace!(seq = beat.seq, cpu = ?beat.cpu, "Sending heartbeat");
        self.transport
            .publish(Packet::broadcast(PacketBody::Heartbeat(beat)))
            .await
    }

    async fn send_local_node_info(&self, target: Option<&NodeId>) -> DiscoveryResult<()> {
        let info = PacketBody::Info(self.registry.get_local_node_info().await);
        let packet = match target {
            Some(target) => Packet::to(target.clone(), info),
            None => Packet::broadcast(info),
        };
        self.transport.publish(packet).await
    }

    async fn discover_node(&self, node_id: &NodeId) -> DiscoveryResult<()> {
        debug!(node_id = %node_id, "Requesting node INFO");
        let discover = PacketBody::Discover {
            sender: self.local_id().clone(),
        };
        self.transport
            .publish(Packet::to(node_id.clone(), discover))
            .await
    }

    async fn discover_all_nodes(&self) -> DiscoveryResult<()> {
        let discover = PacketBody::Discover {
            sender: self.local_id().clone(),
        };
        self.transport.publish(Packet::broadcast(discover)).await
    }

    fn as_pinger(&self) -> Option<Arc<dyn Pinger>> {
        self.me.upgrade().map(|me| me as Arc<dyn Pinger>)
    }
}

#[async_trait]
impl Pinger for LocalBackend {
    async fn ping(&self, node_id: &NodeId) -> RegistryResult<f64> {
        let id = self.registry.io().gen_uuid();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            PendingPing {
                sent_ms: self.registry.io().monotonic_ms(),
                reply: tx,
            },
        );

        let ping = PacketBody::Ping {
            sender: self.local_id().clone(),
            id: id.clone(),
        };
        let sent = self.transport.publish(Packet::to(node_id.clone(), ping)).await;
        let outcome = match sent {
            Ok(()) => tokio::time::timeout(Duration::from_millis(self.ping_timeout_ms), rx)
                .await
                .ok()
                .and_then(Result::ok),
            Err(e) => {
                debug!(node_id = %node_id, error = %e, "Ping not sent");
                None
            }
        };

        self.pings.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        match outcome {
            Some(rtt_ms) => Ok(rtt_ms as f64),
            None => Err(RegistryError::Internal {
                message: format!("ping to {} failed", node_id),
            }),
        }
    }
}
