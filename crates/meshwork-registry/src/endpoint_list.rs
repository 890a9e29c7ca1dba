//! Endpoint lists: every endpoint known for one logical name
//!
//! TigerStyle: Selection is separated from bookkeeping. The list owns which
//! endpoints exist; the strategy only picks among node ids.

use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::node::NodeId;
use crate::node_catalog::NodeCatalog;
use crate::strategies::{SelectionContext, Strategy};
use meshwork_core::constants::INTERNAL_NAME_PREFIX;
use std::sync::Arc;

/// All endpoints for one action name, or one (event name, group) pair
#[derive(Debug)]
pub struct EndpointList<E: Endpoint> {
    name: String,
    group: Option<String>,
    endpoints: Vec<Arc<E>>,
    local_endpoint: Option<Arc<E>>,
    strategy: Arc<dyn Strategy>,
    internal: bool,
    prefer_local: bool,
}

impl<E: Endpoint> EndpointList<E> {
    pub fn new(
        name: impl Into<String>,
        group: Option<String>,
        strategy: Arc<dyn Strategy>,
        prefer_local: bool,
    ) -> Self {
        let name = name.into();
        let internal = name.starts_with(INTERNAL_NAME_PREFIX);
        Self {
            name,
            group,
            endpoints: Vec::new(),
            local_endpoint: None,
            strategy,
            internal,
            prefer_local,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn strategy(&self) -> &Arc<dyn Strategy> {
        &self.strategy
    }

    pub fn endpoints(&self) -> &[Arc<E>] {
        &self.endpoints
    }

    pub fn local_endpoint(&self) -> Option<&Arc<E>> {
        self.local_endpoint.as_ref()
    }

    pub fn has_local(&self) -> bool {
        self.local_endpoint.is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn has_available(&self) -> bool {
        self.endpoints.iter().any(|ep| ep.is_available())
    }

    pub fn available_count(&self) -> usize {
        self.endpoints.iter().filter(|ep| ep.is_available()).count()
    }

    pub fn get_by_node_id(&self, node_id: &NodeId) -> Option<&Arc<E>> {
        self.endpoints.iter().find(|ep| ep.node_id() == node_id)
    }

    /// Add an endpoint, replacing any existing one from the same node
    ///
    /// Returns `true` when the endpoint is new to this list.
    pub fn add(&mut self, endpoint: Arc<E>) -> bool {
        let is_new = match self
            .endpoints
            .iter()
            .position(|ep| ep.node_id() == endpoint.node_id())
        {
            Some(idx) => {
                self.endpoints[idx] = Arc::clone(&endpoint);
                false
            }
            None => {
                self.endpoints.push(Arc::clone(&endpoint));
                true
            }
        };

        if endpoint.is_local() {
            self.local_endpoint = Some(endpoint);
        } else if self
            .local_endpoint
            .as_ref()
            .map_or(false, |local| local.node_id() == endpoint.node_id())
        {
            self.local_endpoint = None;
        }

        debug_assert!(self.endpoints.iter().filter(|ep| ep.is_local()).count() <= 1);
        is_new
    }

    /// Remove the endpoint owned by `node_id`
    pub fn remove_by_node_id(&mut self, node_id: &NodeId) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|ep| ep.node_id() != node_id);
        self.refresh_local();
        before != self.endpoints.len()
    }

    /// Remove the endpoint of service `full_name` on `node_id`
    pub fn remove_by_service(&mut self, full_name: &str, node_id: &NodeId) -> bool {
        let before = self.endpoints.len();
        self.endpoints
            .retain(|ep| !(ep.service() == full_name && ep.node_id() == node_id));
        self.refresh_local();
        before != self.endpoints.len()
    }

    fn refresh_local(&mut self) {
        self.local_endpoint = self.endpoints.iter().find(|ep| ep.is_local()).cloned();
    }

    /// Pick an endpoint for a call
    ///
    /// Internal names stay in-process; a preferred available local endpoint
    /// wins; otherwise the strategy picks over every endpoint, and disabled
    /// picks are retried up to the list length before giving up.
    pub fn next(&self, call: Option<&Context>, nodes: &NodeCatalog) -> Option<Arc<E>> {
        if self.endpoints.is_empty() {
            return None;
        }

        if self.internal {
            if let Some(ref local) = self.local_endpoint {
                return Some(Arc::clone(local));
            }
        }

        if self.prefer_local {
            if let Some(ref local) = self.local_endpoint {
                if local.acquire() {
                    return Some(Arc::clone(local));
                }
            }
        }

        let ctx = SelectionContext { call, nodes };
        let candidates: Vec<&NodeId> = self.endpoints.iter().map(|ep| ep.node_id()).collect();

        for _ in 0..self.endpoints.len() {
            let idx = self.strategy.select(&candidates, &ctx)?;
            let endpoint = self.endpoints.get(idx)?;
            if endpoint.acquire() {
                return Some(Arc::clone(endpoint));
            }
        }
        None
    }

    /// The local endpoint, if present and available
    pub fn next_local(&self) -> Option<Arc<E>> {
        self.local_endpoint
            .as_ref()
            .filter(|ep| ep.acquire())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ActionEndpoint;
    use crate::node::Node;
    use crate::schema::ActionSchema;
    use crate::strategies::RoundRobinStrategy;

    fn endpoint(node: &str, local: bool) -> Arc<ActionEndpoint> {
        Arc::new(ActionEndpoint::new(
            NodeId::new(node).unwrap(),
            "users",
            Arc::new(ActionSchema::new("users.find")),
            local,
            None,
        ))
    }

    fn list(name: &str, prefer_local: bool) -> EndpointList<ActionEndpoint> {
        EndpointList::new(name, None, Arc::new(RoundRobinStrategy::new()), prefer_local)
    }

    fn catalog() -> NodeCatalog {
        let mut catalog = NodeCatalog::new(NodeId::new("node-a").unwrap(), "inst".into(), 0);
        catalog.add(Node::new(NodeId::new("node-b").unwrap(), 0));
        catalog.add(Node::new(NodeId::new("node-c").unwrap(), 0));
        catalog
    }

    #[test]
    fn test_add_replaces_same_node() {
        let mut list = list("users.find", false);
        assert!(list.add(endpoint("node-a", true)));
        assert!(list.add(endpoint("node-b", false)));
        assert!(!list.add(endpoint("node-b", false)));
        assert!(!list.add(endpoint("node-a", true)));

        assert_eq!(list.len(), 2);
        assert!(list.has_local());
    }

    #[test]
    fn test_prefer_local() {
        let catalog = catalog();
        let mut list = list("users.find", true);
        list.add(endpoint("node-a", true));
        list.add(endpoint("node-b", false));

        for _ in 0..5 {
            assert_eq!(list.next(None, &catalog).unwrap().node_id().as_str(), "node-a");
        }

        list.local_endpoint().unwrap().set_state(false);
        for _ in 0..5 {
            assert_eq!(list.next(None, &catalog).unwrap().node_id().as_str(), "node-b");
        }
    }

    #[test]
    fn test_skips_disabled_and_reports_none() {
        let catalog = catalog();
        let mut list = list("users.find", false);
        list.add(endpoint("node-b", false));
        list.add(endpoint("node-c", false));

        list.endpoints()[0].set_state(false);
        for _ in 0..4 {
            assert_eq!(list.next(None, &catalog).unwrap().node_id().as_str(), "node-c");
        }

        list.endpoints()[1].set_state(false);
        assert!(list.next(None, &catalog).is_none());
        assert!(!list.has_available());
    }

    #[test]
    fn test_unavailable_shard_owner_yields_none_without_rebuilding() {
        use crate::strategies::ShardStrategy;
        use meshwork_core::config::ShardOptions;
        use meshwork_core::io::StdRngProvider;
        use serde_json::json;

        let catalog = catalog();
        let shard = Arc::new(ShardStrategy::new(
            ShardOptions {
                key: Some("user.id".into()),
                ..Default::default()
            },
            Arc::new(StdRngProvider::with_seed(5)),
        ));
        let mut list: EndpointList<ActionEndpoint> =
            EndpointList::new("users.find", None, shard.clone(), false);
        list.add(endpoint("node-b", false));
        list.add(endpoint("node-c", false));
        list.add(endpoint("node-d", false));

        let call = Context::new(json!({ "user": { "id": "user-42" } }));
        let owner = list.next(Some(&call), &catalog).unwrap();
        assert_eq!(shard.ring_rebuilds(), 1);

        owner.set_state(false);
        for _ in 0..5 {
            assert!(list.next(Some(&call), &catalog).is_none());
        }
        assert_eq!(shard.ring_rebuilds(), 1);

        owner.set_state(true);
        let again = list.next(Some(&call), &catalog).unwrap();
        assert_eq!(again.node_id(), owner.node_id());
        assert_eq!(shard.ring_rebuilds(), 1);
    }

    #[test]
    fn test_internal_name_stays_local() {
        let catalog = catalog();
        let mut list = list("$node.list", false);
        assert!(list.is_internal());
        list.add(endpoint("node-b", false));
        list.add(endpoint("node-a", true));

        // Even a disabled local endpoint is returned for internal names
        list.local_endpoint().unwrap().set_state(false);
        for _ in 0..3 {
            assert_eq!(list.next(None, &catalog).unwrap().node_id().as_str(), "node-a");
        }
    }

    #[test]
    fn test_remove_by_service_clears_local() {
        let mut list = list("users.find", false);
        list.add(endpoint("node-a", true));
        list.add(endpoint("node-b", false));

        assert!(list.remove_by_service("users", &NodeId::new("node-a").unwrap()));
        assert!(!list.has_local());
        assert!(!list.remove_by_service("users", &NodeId::new("node-a").unwrap()));
        assert!(list.remove_by_node_id(&NodeId::new("node-b").unwrap()));
        assert!(list.is_empty());
    }
}
