//! Node catalog
//!
//! Tracks every known node, local and remote. Pure bookkeeping: the registry
//! decides which lifecycle events to emit from the outcomes returned here.

use crate::introspection::{ListOptions, NodeRecord};
use crate::node::{Node, NodeId};
use crate::packet::NodeInfo;
use std::collections::HashMap;

/// What applying an INFO payload did to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInfoOutcome {
    /// First INFO from this node
    Connected,
    /// The node was offline and is back
    Reconnected,
    /// Known online node, newer payload applied
    Updated,
    /// Stale or duplicate payload, nothing applied
    Unchanged,
}

/// Result of `process_node_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedInfo {
    pub outcome: NodeInfoOutcome,
    /// Services differ from the cached list and must be re-registered
    pub services_changed: bool,
}

#[derive(Debug)]
pub struct NodeCatalog {
    nodes: HashMap<NodeId, Node>,
    local_node_id: NodeId,
}

impl NodeCatalog {
    /// Catalog holding only the local node
    pub fn new(local_node_id: NodeId, instance_id: String, now_ms: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            local_node_id.clone(),
            Node::new_local(local_node_id.clone(), instance_id, now_ms),
        );
        Self {
            nodes,
            local_node_id,
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(&self.local_node_id)
    }

    pub fn local_node_mut(&mut self) -> Option<&mut Node> {
        self.nodes.get_mut(&self.local_node_id)
    }

    pub fn add(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn has(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Remove a node; the local node is never removed
    pub fn delete(&mut self, id: &NodeId) -> Option<Node> {
        if *id == self.local_node_id {
            return None;
        }
        self.nodes.remove(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Create or update a remote node from its INFO payload
    pub fn process_node_info(&mut self, info: &NodeInfo, now_ms: u64) -> ProcessedInfo {
        debug_assert!(info.sender != self.local_node_id);

        match self.nodes.get_mut(&info.sender) {
            None => {
                let mut node = Node::new(info.sender.clone(), now_ms);
                node.update(info, false);
                let services_changed = !node.services.is_empty();
                self.nodes.insert(info.sender.clone(), node);
                ProcessedInfo {
                    outcome: NodeInfoOutcome::Connected,
                    services_changed,
                }
            }
            Some(node) => {
                let reconnected = !node.available;
                if reconnected {
                    node.available = true;
                    node.offline_since_ms = None;
                    node.last_heartbeat_ms = now_ms;
                }

                let update = node.update(info, reconnected);
                if update.applied {
                    node.last_heartbeat_ms = now_ms;
                }

                let outcome = if reconnected {
                    NodeInfoOutcome::Reconnected
                } else if update.applied {
                    NodeInfoOutcome::Updated
                } else {
                    NodeInfoOutcome::Unchanged
                };

                ProcessedInfo {
                    outcome,
                    services_changed: update.services_changed,
                }
            }
        }
    }

    /// Mark a node offline; returns `true` if it was online
    pub fn disconnected(&mut self, id: &NodeId, now_ms: u64) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.available && !node.local => {
                node.disconnected(now_ms);
                true
            }
            _ => false,
        }
    }

    pub fn list(&self, opts: &ListOptions) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .nodes
            .values()
            .filter(|n| !opts.only_local || n.local)
            .filter(|n| !opts.only_available || n.available)
            .map(|n| NodeRecord {
                id: n.id.to_string(),
                instance_id: n.instance_id.clone(),
                available: n.available,
                local: n.local,
                seq: n.seq,
                cpu: n.cpu,
                hostname: n.hostname.clone(),
                ip_list: n.ip_list.clone(),
                port: n.port,
                client: n.client.clone(),
                last_heartbeat_ms: n.last_heartbeat_ms,
                offline_since_ms: n.offline_since_ms,
                metadata: n.metadata.clone(),
                services: if opts.with_actions || opts.with_endpoints {
                    Some(
                        n.services
                            .iter()
                            .map(|s| s.resolved_full_name())
                            .collect(),
                    )
                } else {
                    None
                },
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ServiceInfo;

    fn catalog() -> NodeCatalog {
        NodeCatalog::new(NodeId::new("local").unwrap(), "inst-local".into(), 0)
    }

    fn info(seq: u64) -> NodeInfo {
        let mut info = NodeInfo::new(NodeId::new("node-2").unwrap(), "inst-2".into());
        info.seq = seq;
        info.services = vec![ServiceInfo::new("users", None)];
        info
    }

    #[test]
    fn test_local_node_present_and_not_deletable() {
        let mut catalog = catalog();
        let local = catalog.local_node_id().clone();
        assert!(catalog.local_node().unwrap().local);
        assert!(catalog.delete(&local).is_none());
        assert!(!catalog.disconnected(&local, 10));
        assert!(catalog.local_node().unwrap().available);
    }

    #[test]
    fn test_process_node_info_lifecycle() {
        let mut catalog = catalog();
        let id = NodeId::new("node-2").unwrap();

        let first = catalog.process_node_info(&info(1), 0);
        assert_eq!(first.outcome, NodeInfoOutcome::Connected);
        assert!(first.services_changed);

        let dup = catalog.process_node_info(&info(1), 5);
        assert_eq!(dup.outcome, NodeInfoOutcome::Unchanged);
        assert!(!dup.services_changed);

        // Newer seq with the same services still counts as an update
        let mut meta = info(2);
        meta.hostname = Some("moved".into());
        let moved = catalog.process_node_info(&meta, 7);
        assert_eq!(moved.outcome, NodeInfoOutcome::Updated);
        assert!(!moved.services_changed);
        assert_eq!(catalog.get(&id).unwrap().last_heartbeat_ms, 7);

        assert!(catalog.disconnected(&id, 10));
        assert!(!catalog.disconnected(&id, 11));

        // Disconnect bumped seq to 3; the node comes back with seq 1 of the same instance
        let back = catalog.process_node_info(&info(1), 20);
        assert_eq!(back.outcome, NodeInfoOutcome::Reconnected);
        assert!(back.services_changed);
        assert!(catalog.get(&id).unwrap().available);
    }

    #[test]
    fn test_list_filters() {
        let mut catalog = catalog();
        catalog.process_node_info(&info(1), 0);
        catalog.disconnected(&NodeId::new("node-2").unwrap(), 1);

        assert_eq!(catalog.list(&ListOptions::default()).len(), 2);
        let only_available = ListOptions {
            only_available: true,
            ..Default::default()
        };
        assert_eq!(catalog.list(&only_available).len(), 1);
        let only_local = ListOptions {
            only_local: true,
            ..Default::default()
        };
        assert_eq!(catalog.list(&only_local)[0].id, "local");
    }
}
