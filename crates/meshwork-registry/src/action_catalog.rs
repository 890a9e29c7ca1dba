//! Action catalog: action name → endpoint list
//!
//! Lists are created lazily on first `add`, with the action's own strategy
//! or the registry default. Lists emptied by service teardown stay in place
//! so callers see "not available" rather than "not found" while a node is
//! away; only explicit action removal evicts an empty list.

use crate::circuit_breaker::CircuitBreaker;
use crate::endpoint::{ActionEndpoint, Endpoint};
use crate::endpoint_list::EndpointList;
use crate::events::RegistryEvent;
use crate::introspection::{circuit_label, ActionRecord, EndpointRecord, ListOptions};
use crate::node::NodeId;
use crate::schema::ActionSchema;
use crate::service::ServiceItem;
use crate::strategies::{create_strategy, LatencyProber, StrategyDeps, StrategySpec};
use meshwork_core::config::CircuitBreakerConfig;
use meshwork_core::io::IoContext;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared settings for building endpoint lists and endpoints
#[derive(Clone)]
pub struct CatalogSettings {
    pub default_strategy: StrategySpec,
    pub prefer_local: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub io: IoContext,
    pub events: broadcast::Sender<RegistryEvent>,
    pub metrics_enabled: bool,
    pub latency: Arc<LatencyProber>,
}

impl std::fmt::Debug for CatalogSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogSettings")
            .field("default_strategy", &self.default_strategy)
            .field("prefer_local", &self.prefer_local)
            .field("circuit_breaker", &self.circuit_breaker.enabled)
            .finish()
    }
}

impl CatalogSettings {
    pub(crate) fn strategy_deps(&self) -> StrategyDeps {
        StrategyDeps {
            rng: self.io.rng.clone(),
            latency: self.latency.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ActionCatalog {
    actions: HashMap<String, EndpointList<ActionEndpoint>>,
    settings: Arc<CatalogSettings>,
}

impl ActionCatalog {
    pub fn new(settings: Arc<CatalogSettings>) -> Self {
        Self {
            actions: HashMap::new(),
            settings,
        }
    }

    /// Add (or replace) the endpoint of `action` on `node_id`
    pub fn add(
        &mut self,
        node_id: &NodeId,
        service: &ServiceItem,
        action: Arc<ActionSchema>,
    ) -> Arc<ActionEndpoint> {
        let settings = &self.settings;
        let list = self.actions.entry(action.name.clone()).or_insert_with(|| {
            let spec = action
                .strategy
                .as_ref()
                .unwrap_or(&settings.default_strategy);
            let strategy = create_strategy(spec, &settings.strategy_deps());
            EndpointList::new(action.name.clone(), None, strategy, settings.prefer_local)
        });

        let breaker = if settings.circuit_breaker.enabled {
            Some(CircuitBreaker::new(
                action.name.clone(),
                node_id.clone(),
                settings.circuit_breaker.clone(),
                settings.io.time.clone(),
                settings.events.clone(),
                settings.metrics_enabled,
            ))
        } else {
            None
        };

        let endpoint = Arc::new(ActionEndpoint::new(
            node_id.clone(),
            service.full_name.clone(),
            action,
            service.local,
            breaker,
        ));
        list.add(Arc::clone(&endpoint));
        endpoint
    }

    pub fn get(&self, name: &str) -> Option<&EndpointList<ActionEndpoint>> {
        self.actions.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Remove one node's endpoint; evicts the list once empty
    pub fn remove(&mut self, name: &str, node_id: &NodeId) -> bool {
        let Some(list) = self.actions.get_mut(name) else {
            return false;
        };
        let removed = list.remove_by_node_id(node_id);
        if list.is_empty() {
            self.actions.remove(name);
        }
        removed
    }

    /// Remove every endpoint owned by service `full_name` on `node_id`
    pub fn remove_by_service(&mut self, full_name: &str, node_id: &NodeId) -> usize {
        self.actions
            .values_mut()
            .map(|list| list.remove_by_service(full_name, node_id))
            .filter(|removed| *removed)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointList<ActionEndpoint>> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn list(&self, opts: &ListOptions) -> Vec<ActionRecord> {
        let mut records: Vec<ActionRecord> = self
            .actions
            .values()
            .filter(|list| !opts.skip_internal || !list.is_internal())
            .filter(|list| !opts.only_local || list.has_local())
            .filter(|list| !opts.only_available || list.has_available())
            .map(|list| {
                let visibility = list
                    .endpoints()
                    .first()
                    .and_then(|ep| ep.action().visibility);
                let endpoints = opts.with_endpoints.then(|| {
                    list.endpoints()
                        .iter()
                        .map(|ep| EndpointRecord {
                            node_id: ep.node_id().to_string(),
                            service: ep.service().to_string(),
                            local: ep.is_local(),
                            available: ep.is_available(),
                            circuit: ep.breaker().map(|b| circuit_label(b.state())),
                        })
                        .collect()
                });
                ActionRecord {
                    name: list.name().to_string(),
                    visibility,
                    strategy: list.strategy().name().to_string(),
                    count: list.len(),
                    has_local: list.has_local(),
                    available: list.has_available(),
                    endpoints,
                }
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::strategies::ProberRole;
    use meshwork_core::io::ManualClock;

    pub fn settings(clock: Arc<ManualClock>, prefer_local: bool) -> Arc<CatalogSettings> {
        let (events, _) = broadcast::channel(64);
        Arc::new(CatalogSettings {
            default_strategy: StrategySpec::default(),
            prefer_local,
            circuit_breaker: CircuitBreakerConfig::default(),
            io: IoContext::for_testing(clock, 7),
            events,
            metrics_enabled: false,
            latency: Arc::new(LatencyProber::new(ProberRole::Follower, 5)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::settings;
    use super::*;
    use crate::packet::ServiceInfo;
    use meshwork_core::config::StrategyConfig;
    use meshwork_core::io::ManualClock;

    fn service(node: &NodeId, name: &str, local: bool) -> ServiceItem {
        ServiceItem::new(node.clone(), &ServiceInfo::new(name, None), local)
    }

    #[test]
    fn test_add_creates_list_with_action_strategy() {
        let mut catalog = ActionCatalog::new(settings(Arc::new(ManualClock::new(0)), false));
        let a = NodeId::new("node-a").unwrap();
        let b = NodeId::new("node-b").unwrap();

        let find = Arc::new(
            ActionSchema::new("find").with_strategy(StrategySpec::Builtin(StrategyConfig::Random)),
        );
        catalog.add(&a, &service(&a, "users", true), Arc::clone(&find));
        catalog.add(&b, &service(&b, "users", false), Arc::clone(&find));
        catalog.add(&b, &service(&b, "users", false), find);

        let list = catalog.get("find").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.strategy().name(), "random");
    }

    #[test]
    fn test_remove_by_service_keeps_empty_list() {
        let mut catalog = ActionCatalog::new(settings(Arc::new(ManualClock::new(0)), false));
        let b = NodeId::new("node-b").unwrap();
        catalog.add(&b, &service(&b, "users", false), Arc::new(ActionSchema::new("users.find")));

        assert_eq!(catalog.remove_by_service("users", &b), 1);
        assert!(catalog.has("users.find"));
        assert!(!catalog.get("users.find").unwrap().has_available());

        catalog.add(&b, &service(&b, "users", false), Arc::new(ActionSchema::new("users.find")));
        assert!(catalog.remove("users.find", &b));
        assert!(!catalog.has("users.find"));
    }

    #[test]
    fn test_breaker_attached_when_enabled() {
        let (events, _) = broadcast::channel(8);
        let settings = Arc::new(CatalogSettings {
            circuit_breaker: CircuitBreakerConfig::enabled(),
            events,
            ..(*settings(Arc::new(ManualClock::new(0)), false)).clone()
        });
        let mut catalog = ActionCatalog::new(settings);
        let b = NodeId::new("node-b").unwrap();
        let ep = catalog.add(&b, &service(&b, "users", false), Arc::new(ActionSchema::new("users.find")));
        assert!(ep.breaker().is_some());

        let records = catalog.list(&ListOptions {
            with_endpoints: true,
            ..Default::default()
        });
        let endpoints = records[0].endpoints.as_ref().unwrap();
        assert_eq!(endpoints[0].circuit, Some("closed"));
    }
}
