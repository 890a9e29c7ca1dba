//! Node types and identification
//!
//! TigerStyle: Explicit node lifecycle with validated identifiers.
//!
//! A `Node` is one runtime instance in the mesh. Liveness timestamps are
//! monotonic milliseconds from the registry's `TimeProvider`; they are never
//! compared against wall-clock values.

use crate::error::{RegistryError, RegistryResult};
use crate::packet::{ClientInfo, HeartbeatPayload, NodeInfo, ServiceInfo};
use meshwork_core::constants::NODE_ID_LENGTH_BYTES_MAX;
use meshwork_core::io::RngProvider;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a mesh node
///
/// Node IDs should be stable across restarts for the same service process,
/// typically configured explicitly or derived from hostname and pid.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId with validation
    ///
    /// # Errors
    /// Returns error if id is empty, too long, or contains whitespace or
    /// control characters.
    pub fn new(id: impl Into<String>) -> RegistryResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(RegistryError::InvalidNodeId {
                id,
                reason: "node ID cannot be empty".into(),
            });
        }

        if id.len() > NODE_ID_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidNodeId {
                reason: format!(
                    "node ID length {} exceeds limit {}",
                    id.len(),
                    NODE_ID_LENGTH_BYTES_MAX
                ),
                id,
            });
        }

        // Node IDs end up in KV key paths
        let valid = id
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && c != '/');

        if !valid {
            return Err(RegistryError::InvalidNodeId {
                id,
                reason: "node ID contains invalid characters".into(),
            });
        }

        Ok(Self(id))
    }

    /// Get the node ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a node ID from hostname, process id and a random suffix
    pub fn generate(rng: &dyn RngProvider) -> Self {
        let hostname = local_hostname();
        let suffix = rng.next_u64() as u16;
        let mut id = format!("{}-{}-{:04x}", hostname, std::process::id(), suffix);
        id.retain(|c| !c.is_whitespace() && !c.is_control() && c != '/');

        if id.len() > NODE_ID_LENGTH_BYTES_MAX {
            let mut end = NODE_ID_LENGTH_BYTES_MAX;
            while !id.is_char_boundary(end) {
                end -= 1;
            }
            id.truncate(end);
        }

        debug_assert!(!id.is_empty());
        Self(id)
    }
}

impl TryFrom<String> for NodeId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hostname of this machine, or "unknown"
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A node known to the registry (local or remote)
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub instance_id: Option<String>,
    pub available: bool,
    pub local: bool,
    /// Monotonic ms of the last heartbeat or INFO
    pub last_heartbeat_ms: u64,
    /// Monotonic ms when the node went offline
    pub offline_since_ms: Option<u64>,
    pub seq: u64,
    /// Last reported CPU usage in percent
    pub cpu: Option<f64>,
    pub cpu_seq: u64,
    pub hostname: Option<String>,
    pub ip_list: Vec<String>,
    pub port: Option<u16>,
    pub client: ClientInfo,
    pub config: serde_json::Value,
    pub metadata: serde_json::Value,
    pub services: Vec<ServiceInfo>,
    pub raw_info: Option<NodeInfo>,
}

/// What [`Node::update`] did with a payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    /// The payload was newer and its fields were copied
    pub applied: bool,
    /// Catalogs must be re-registered from the new service list
    pub services_changed: bool,
}

impl Node {
    /// Create a node that has not announced anything yet
    pub fn new(id: NodeId, now_ms: u64) -> Self {
        Self {
            id,
            instance_id: None,
            available: true,
            local: false,
            last_heartbeat_ms: now_ms,
            offline_since_ms: None,
            seq: 0,
            cpu: None,
            cpu_seq: 0,
            hostname: None,
            ip_list: Vec::new(),
            port: None,
            client: ClientInfo::default(),
            config: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            services: Vec::new(),
            raw_info: None,
        }
    }

    /// Create the single local node
    pub fn new_local(id: NodeId, instance_id: String, now_ms: u64) -> Self {
        let mut node = Self::new(id, now_ms);
        node.local = true;
        node.instance_id = Some(instance_id);
        node.hostname = Some(local_hostname());
        node.client = ClientInfo::current();
        node
    }

    /// Apply an INFO payload
    ///
    /// A payload that is not newer than the cached one from the same
    /// instance is ignored entirely. Anything else is applied, and
    /// `services_changed` is set when the announced services differ from
    /// the cached ones (or the node reconnected).
    pub fn update(&mut self, info: &NodeInfo, reconnected: bool) -> NodeUpdate {
        let new_seq = info.seq.max(1);
        let same_instance = self.instance_id.as_deref() == Some(info.instance_id.as_str());

        if !reconnected && same_instance && new_seq <= self.seq {
            return NodeUpdate::default();
        }

        let services_changed = reconnected || !same_instance || self.services != info.services;

        self.ip_list = info.ip_list.clone();
        self.hostname = info.hostname.clone();
        self.port = info.port;
        self.client = info.client.clone();
        self.config = info.config.clone();
        self.metadata = info.metadata.clone();
        self.services = info.services.clone();
        self.seq = new_seq;
        self.instance_id = Some(info.instance_id.clone());
        self.raw_info = Some(info.clone());

        NodeUpdate {
            applied: true,
            services_changed,
        }
    }

    /// Record a heartbeat
    pub fn heartbeat(&mut self, payload: &HeartbeatPayload, now_ms: u64) {
        if !self.available {
            self.available = true;
            self.offline_since_ms = None;
        }

        if let Some(cpu) = payload.cpu {
            self.cpu = Some(cpu);
            self.cpu_seq = self.cpu_seq.saturating_add(1);
        }

        self.last_heartbeat_ms = now_ms;
    }

    /// Mark the node offline
    pub fn disconnected(&mut self, now_ms: u64) {
        if self.available {
            self.offline_since_ms = Some(now_ms);
            self.seq = self.seq.saturating_add(1);
        }
        self.available = false;
    }

    /// Whether the last heartbeat is older than `timeout_ms`
    pub fn is_heartbeat_timeout(&self, now_ms: u64, timeout_ms: u64) -> bool {
        debug_assert!(timeout_ms > 0);
        now_ms.saturating_sub(self.last_heartbeat_ms) > timeout_ms
    }

    /// Whether the node has been offline longer than `timeout_ms`
    pub fn is_offline_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        match self.offline_since_ms {
            Some(since) if !self.available => now_ms.saturating_sub(since) > timeout_ms,
            _ => false,
        }
    }
}
