//! Service catalog

use crate::introspection::{ListOptions, ServiceRecord};
use crate::node::NodeId;
use crate::node_catalog::NodeCatalog;
use crate::packet::ServiceInfo;
use crate::service::ServiceItem;
use meshwork_core::constants::INTERNAL_NAME_PREFIX;

/// Every service instance on every known node
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: Vec<ServiceItem>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully built item, replacing any item for the same node
    pub fn insert(&mut self, item: ServiceItem) {
        self.services
            .retain(|s| !s.matches(&item.full_name, &item.node_id));
        self.services.push(item);
    }

    pub fn remove(&mut self, full_name: &str, node_id: &NodeId) -> Option<ServiceItem> {
        let idx = self
            .services
            .iter()
            .position(|s| s.matches(full_name, node_id))?;
        Some(self.services.remove(idx))
    }

    /// Remove every service of a node
    pub fn remove_all_by_node(&mut self, node_id: &NodeId) -> Vec<ServiceItem> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.services)
            .into_iter()
            .partition(|s| &s.node_id == node_id);
        self.services = kept;
        removed
    }

    pub fn by_node<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a ServiceItem> {
        self.services.iter().filter(move |s| &s.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn list(&self, opts: &ListOptions, nodes: &NodeCatalog) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|s| !opts.only_local || s.local)
            .filter(|s| !opts.skip_internal || !s.name.starts_with(INTERNAL_NAME_PREFIX))
            .filter_map(|s| {
                let available = nodes.get(&s.node_id).map_or(false, |n| n.available);
                if opts.only_available && !available {
                    return None;
                }
                Some(ServiceRecord {
                    name: s.name.clone(),
                    version: s.version.clone(),
                    full_name: s.full_name.clone(),
                    node_id: s.node_id.to_string(),
                    local: s.local,
                    available,
                    settings: s.settings.clone(),
                    metadata: s.metadata.clone(),
                    actions: opts
                        .with_actions
                        .then(|| s.actions.keys().cloned().collect()),
                    events: opts.with_events.then(|| s.events.keys().cloned().collect()),
                })
            })
            .collect()
    }
}
