//! Service instances owned by nodes

use crate::node::NodeId;
use crate::packet::ServiceInfo;
use crate::schema::{ActionSchema, EventSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Service version, numeric or free-form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceVersion {
    Number(u64),
    Text(String),
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Version-prefixed service name: `v2.users`, `beta.users`, or `users`
pub fn service_full_name(name: &str, version: Option<&ServiceVersion>) -> String {
    match version {
        Some(ServiceVersion::Number(n)) => format!("v{}.{}", n, name),
        Some(ServiceVersion::Text(s)) if !s.is_empty() => format!("{}.{}", s, name),
        _ => name.to_string(),
    }
}

/// One service instance on exactly one node
///
/// Refers to its node by id only; the node catalog owns nodes.
#[derive(Debug, Clone)]
pub struct ServiceItem {
    pub name: String,
    pub version: Option<ServiceVersion>,
    pub full_name: String,
    pub settings: Value,
    pub metadata: Value,
    pub dependencies: Vec<String>,
    pub node_id: NodeId,
    pub local: bool,
    pub actions: BTreeMap<String, Arc<ActionSchema>>,
    pub events: BTreeMap<String, Arc<EventSchema>>,
}

impl ServiceItem {
    /// Service item without actions or events
    pub fn new(node_id: NodeId, info: &ServiceInfo, local: bool) -> Self {
        Self {
            name: info.name.clone(),
            version: info.version.clone(),
            full_name: info.resolved_full_name(),
            settings: info.settings.clone(),
            metadata: info.metadata.clone(),
            dependencies: info.dependencies.clone(),
            node_id,
            local,
            actions: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    /// Whether this item is `full_name` on `node_id`
    pub fn matches(&self, full_name: &str, node_id: &NodeId) -> bool {
        self.full_name == full_name && &self.node_id == node_id
    }

    /// Public description for INFO packets
    pub fn to_info(&self) -> ServiceInfo {
        let mut info = ServiceInfo::new(self.name.clone(), self.version.clone());
        info.full_name = self.full_name.clone();
        info.settings = self.settings.clone();
        info.metadata = self.metadata.clone();
        info.dependencies = self.dependencies.clone();
        info.actions = self
            .actions
            .iter()
            .map(|(name, schema)| (name.clone(), schema.to_info()))
            .collect();
        info.events = self
            .events
            .iter()
            .map(|(name, schema)| (name.clone(), schema.to_info()))
            .collect();
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        assert_eq!(service_full_name("users", None), "users");
        assert_eq!(
            service_full_name("users", Some(&ServiceVersion::Number(2))),
            "v2.users"
        );
        assert_eq!(
            service_full_name("users", Some(&ServiceVersion::Text("beta".into()))),
            "beta.users"
        );
    }

    #[test]
    fn test_version_wire_forms() {
        let n: ServiceVersion = serde_json::from_str("3").unwrap();
        assert_eq!(n, ServiceVersion::Number(3));
        let s: ServiceVersion = serde_json::from_str("\"staging\"").unwrap();
        assert_eq!(s, ServiceVersion::Text("staging".into()));
    }
}
