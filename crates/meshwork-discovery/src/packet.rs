//! Discovery packets and their encoding
//!
//! TigerStyle: Explicit packet types, one serializer per discoverer.

use crate::error::{DiscoveryError, DiscoveryResult};
use bytes::Bytes;
use meshwork_core::config::SerializerKind;
use meshwork_registry::{HeartbeatPayload, NodeId, NodeInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Topic a packet is published on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    Discover,
    Info,
    Heartbeat,
    Disconnect,
    Ping,
    Pong,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Info => "INFO",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet body as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketBody {
    /// Ask the receiver(s) to send their INFO
    Discover { sender: NodeId },
    Info(NodeInfo),
    Heartbeat(HeartbeatPayload),
    /// Graceful shutdown of the sender
    Disconnect { sender: NodeId },
    Ping { sender: NodeId, id: String },
    Pong { sender: NodeId, id: String },
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Discover { .. } => PacketType::Discover,
            Self::Info(_) => PacketType::Info,
            Self::Heartbeat(_) => PacketType::Heartbeat,
            Self::Disconnect { .. } => PacketType::Disconnect,
            Self::Ping { .. } => PacketType::Ping,
            Self::Pong { .. } => PacketType::Pong,
        }
    }

    pub fn sender(&self) -> &NodeId {
        match self {
            Self::Discover { sender }
            | Self::Disconnect { sender }
            | Self::Ping { sender, .. }
            | Self::Pong { sender, .. } => sender,
            Self::Info(info) => &info.sender,
            Self::Heartbeat(beat) => &beat.sender,
        }
    }
}

/// A body plus its routing; `target: None` broadcasts to every other node
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub target: Option<NodeId>,
    pub body: PacketBody,
}

impl Packet {
    pub fn broadcast(body: PacketBody) -> Self {
        Self { target: None, body }
    }

    pub fn to(target: NodeId, body: PacketBody) -> Self {
        Self {
            target: Some(target),
            body,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }
}

/// Encodes packets and KV values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Serializer {
    kind: SerializerKind,
}

impl Serializer {
    pub fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> DiscoveryResult<Bytes> {
        let raw = match self.kind {
            SerializerKind::Json => {
                serde_json::to_vec(value).map_err(DiscoveryError::serialization)?
            }
            SerializerKind::Cbor => {
                serde_cbor::to_vec(value).map_err(DiscoveryError::serialization)?
            }
        };
        Ok(Bytes::from(raw))
    }

    pub fn decode<T: DeserializeOwned>(&self, raw: &[u8]) -> DiscoveryResult<T> {
        match self.kind {
            SerializerKind::Json => serde_json::from_slice(raw).map_err(DiscoveryError::serialization),
            SerializerKind::Cbor => serde_cbor::from_slice(raw).map_err(DiscoveryError::serialization),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_body_tagged_on_the_wire() {
        let body = PacketBody::Discover {
            sender: node("node-1"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "DISCOVER");
        assert_eq!(json["sender"], "node-1");

        let beat = PacketBody::Heartbeat(HeartbeatPayload {
            sender: node("node-1"),
            cpu: Some(4.0),
            seq: 2,
            instance_id: "abc".into(),
        });
        let json = serde_json::to_value(&beat).unwrap();
        assert_eq!(json["type"], "HEARTBEAT");
        assert_eq!(json["instanceID"], "abc");
    }

    #[test]
    fn test_info_survives_cbor() {
        let serializer = Serializer::new(SerializerKind::Cbor);
        let mut info = NodeInfo::new(node("node-7"), "inst-7".into());
        info.seq = 5;
        info.hostname = Some("host-a".into());

        let raw = serializer.encode(&PacketBody::Info(info.clone())).unwrap();
        let decoded: PacketBody = serializer.decode(&raw).unwrap();
        assert_eq!(decoded, PacketBody::Info(info));
        assert_eq!(decoded.sender(), &node("node-7"));
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        let serializer = Serializer::new(SerializerKind::Json);
        let result: DiscoveryResult<PacketBody> = serializer.decode(b"{not json");
        assert!(matches!(result, Err(DiscoveryError::Serialization { .. })));
    }
}
