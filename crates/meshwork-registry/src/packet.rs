//! Wire payloads exchanged between nodes
//!
//! The INFO document is a node's complete self-description; the heartbeat is
//! the lightweight, high-frequency liveness signal. Field names on the wire
//! follow the mesh protocol (`sender`, `ver`, `ipList`, `instanceID`, ...).
//! Only public schema data crosses the wire; handlers never do.

use crate::node::NodeId;
use crate::schema::Visibility;
use crate::service::{service_full_name, ServiceVersion};
use meshwork_core::config::StrategyConfig;
use meshwork_core::constants::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_seq() -> u64 {
    1
}

/// Full node announcement (INFO packet body)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub sender: NodeId,
    pub ver: String,
    #[serde(default)]
    pub ip_list: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_seq")]
    pub seq: u64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
}

impl NodeInfo {
    /// Empty announcement for the current protocol version
    pub fn new(sender: NodeId, instance_id: String) -> Self {
        Self {
            sender,
            ver: PROTOCOL_VERSION.to_string(),
            ip_list: Vec::new(),
            hostname: None,
            instance_id,
            client: ClientInfo::current(),
            config: Value::Null,
            port: None,
            seq: default_seq(),
            metadata: Value::Null,
            services: Vec::new(),
        }
    }
}

/// Runtime that produced a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub lang_version: String,
}

impl ClientInfo {
    /// Describe this build
    pub fn current() -> Self {
        Self {
            kind: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            lang_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// Public description of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ServiceVersion>,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionInfo>,
    #[serde(default)]
    pub events: BTreeMap<String, EventInfo>,
}

impl ServiceInfo {
    /// Service with no actions or events
    pub fn new(name: impl Into<String>, version: Option<ServiceVersion>) -> Self {
        let name = name.into();
        let full_name = service_full_name(&name, version.as_ref());
        Self {
            name,
            version,
            full_name,
            settings: Value::Null,
            metadata: Value::Null,
            dependencies: Vec::new(),
            actions: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    /// Full name, computing it when the sender left it blank
    pub fn resolved_full_name(&self) -> String {
        if self.full_name.is_empty() {
            service_full_name(&self.name, self.version.as_ref())
        } else {
            self.full_name.clone()
        }
    }
}

/// Public action schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInfo {
    pub name: String,
    #[serde(default)]
    pub raw_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub metadata: Value,
}

/// Public event schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Lightweight liveness signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sender: NodeId,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default = "default_seq")]
    pub seq: u64,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_wire_names() {
        let mut info = NodeInfo::new(NodeId::new("node-1").unwrap(), "abc".into());
        info.ip_list = vec!["10.0.0.1".into()];
        let json = serde_json::to_value(&info).unwrap();

        assert_eq!(json["sender"], "node-1");
        assert_eq!(json["ver"], PROTOCOL_VERSION);
        assert_eq!(json["instanceID"], "abc");
        assert_eq!(json["ipList"][0], "10.0.0.1");
        assert_eq!(json["client"]["type"], "rust");
        assert!(json["client"].get("langVersion").is_some());
    }

    #[test]
    fn test_node_info_minimal_payload() {
        let json = r#"{"sender":"node-9","ver":"4","instanceID":"x"}"#;
        let info: NodeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.seq, 1);
        assert!(info.services.is_empty());
    }

    #[test]
    fn test_service_info_full_name_fallback() {
        let json = r#"{"name":"users","version":2}"#;
        let svc: ServiceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(svc.resolved_full_name(), "v2.users");
    }

    #[test]
    fn test_heartbeat_wire_names() {
        let beat = HeartbeatPayload {
            sender: NodeId::new("node-1").unwrap(),
            cpu: Some(12.5),
            seq: 3,
            instance_id: "abc".into(),
        };
        let json = serde_json::to_value(&beat).unwrap();
        assert_eq!(json["instanceID"], "abc");
        assert_eq!(json["cpu"], 12.5);
    }
}
