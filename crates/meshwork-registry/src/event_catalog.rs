//! Event catalog: (event name or pattern, group) → endpoint list
//!
//! One subscription name may appear under several groups. A balanced emit
//! reaches one endpoint per matching group; a broadcast reaches every
//! matching endpoint once.

use crate::action_catalog::CatalogSettings;
use crate::endpoint::{Endpoint, EventEndpoint};
use crate::endpoint_list::EndpointList;
use crate::introspection::{EndpointRecord, EventRecord, ListOptions};
use crate::node::NodeId;
use crate::node_catalog::NodeCatalog;
use crate::schema::EventSchema;
use crate::service::ServiceItem;
use crate::strategies::create_strategy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Whether a subscription name contains wildcards
fn is_pattern(name: &str) -> bool {
    name.contains('*') || name.contains('?')
}

/// Compile a subscription pattern
///
/// `**` matches anything including dots, `*` matches within one
/// dot-separated segment, `?` matches a single character.
pub fn compile_pattern(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern);
    let body = escaped
        .replace(r"\*\*", "\u{0}")
        .replace(r"\*", "[^.]*")
        .replace('\u{0}', ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{}$", body)).ok()
}

/// Whether `event_name` matches subscription `name`
pub fn match_event(event_name: &str, name: &str) -> bool {
    if !is_pattern(name) {
        return event_name == name;
    }
    compile_pattern(name).map_or(false, |re| re.is_match(event_name))
}

#[derive(Debug)]
struct Subscription {
    pattern: Option<Regex>,
    list: EndpointList<EventEndpoint>,
}

impl Subscription {
    fn matches(&self, event_name: &str) -> bool {
        match self.pattern {
            Some(ref re) => re.is_match(event_name),
            None => self.list.name() == event_name,
        }
    }
}

#[derive(Debug)]
pub struct EventCatalog {
    events: BTreeMap<(String, String), Subscription>,
    settings: Arc<CatalogSettings>,
}

impl EventCatalog {
    pub fn new(settings: Arc<CatalogSettings>) -> Self {
        Self {
            events: BTreeMap::new(),
            settings,
        }
    }

    /// Add (or replace) the endpoint of `event` on `node_id`
    pub fn add(
        &mut self,
        node_id: &NodeId,
        service: &ServiceItem,
        event: Arc<EventSchema>,
    ) -> Arc<EventEndpoint> {
        let endpoint = Arc::new(EventEndpoint::new(
            node_id.clone(),
            service.full_name.clone(),
            &service.name,
            Arc::clone(&event),
            service.local,
        ));
        let group = endpoint.group().to_string();

        let settings = &self.settings;
        let subscription = self
            .events
            .entry((event.name.clone(), group.clone()))
            .or_insert_with(|| {
                let strategy = create_strategy(&settings.default_strategy, &settings.strategy_deps());
                Subscription {
                    pattern: if is_pattern(&event.name) {
                        compile_pattern(&event.name)
                    } else {
                        None
                    },
                    list: EndpointList::new(
                        event.name.clone(),
                        Some(group),
                        strategy,
                        settings.prefer_local,
                    ),
                }
            });
        subscription.list.add(Arc::clone(&endpoint));
        endpoint
    }

    pub fn get(&self, name: &str, group: &str) -> Option<&EndpointList<EventEndpoint>> {
        self.events
            .get(&(name.to_string(), group.to_string()))
            .map(|s| &s.list)
    }

    /// Remove the subscription to `name` held by service `full_name` on `node_id`
    pub fn remove(&mut self, name: &str, full_name: &str, node_id: &NodeId) -> bool {
        let mut removed = false;
        for ((sub_name, _), sub) in self.events.iter_mut() {
            if sub_name == name {
                removed |= sub.list.remove_by_service(full_name, node_id);
            }
        }
        self.events.retain(|_, sub| !sub.list.is_empty());
        removed
    }

    /// Remove every endpoint owned by service `full_name` on `node_id`
    pub fn remove_by_service(&mut self, full_name: &str, node_id: &NodeId) -> usize {
        let removed = self
            .events
            .values_mut()
            .map(|sub| sub.list.remove_by_service(full_name, node_id))
            .filter(|removed| *removed)
            .count();
        self.events.retain(|_, sub| !sub.list.is_empty());
        removed
    }

    fn matching<'a>(
        &'a self,
        event_name: &'a str,
        groups: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.events.iter().filter_map(move |((_, group), sub)| {
            let group_ok = groups.map_or(true, |gs| gs.iter().any(|g| g == group));
            (group_ok && sub.matches(event_name)).then_some(sub)
        })
    }

    /// One available endpoint per matching group, picked by that group's strategy
    pub fn get_balanced_endpoints(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
        nodes: &NodeCatalog,
    ) -> Vec<(Arc<EventEndpoint>, String)> {
        self.matching(event_name, groups)
            .filter_map(|sub| {
                let endpoint = sub.list.next(None, nodes)?;
                Some((endpoint, sub.list.group().unwrap_or_default().to_string()))
            })
            .collect()
    }

    /// Every available matching endpoint, at most one per node
    pub fn get_all_endpoints(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
    ) -> Vec<Arc<EventEndpoint>> {
        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        for sub in self.matching(event_name, groups) {
            for ep in sub.list.endpoints() {
                if ep.is_available() && seen.insert(ep.node_id().clone()) {
                    endpoints.push(Arc::clone(ep));
                }
            }
        }
        endpoints
    }

    /// Groups subscribed to `event_name`
    pub fn get_groups(&self, event_name: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .matching(event_name, None)
            .filter_map(|sub| sub.list.group().map(str::to_string))
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Available local endpoints of matching subscriptions, one per group
    pub fn local_endpoints(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
    ) -> Vec<Arc<EventEndpoint>> {
        self.matching(event_name, groups)
            .filter_map(|sub| sub.list.next_local())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn list(&self, opts: &ListOptions) -> Vec<EventRecord> {
        self.events
            .values()
            .map(|sub| &sub.list)
            .filter(|list| !opts.skip_internal || !list.is_internal())
            .filter(|list| !opts.only_local || list.has_local())
            .filter(|list| !opts.only_available || list.has_available())
            .map(|list| EventRecord {
                name: list.name().to_string(),
                group: list.group().unwrap_or_default().to_string(),
                count: list.len(),
                has_local: list.has_local(),
                available: list.has_available(),
                endpoints: opts.with_endpoints.then(|| {
                    list.endpoints()
                        .iter()
                        .map(|ep| EndpointRecord {
                            node_id: ep.node_id().to_string(),
                            service: ep.service().to_string(),
                            local: ep.is_local(),
                            available: ep.is_available(),
                            circuit: None,
                        })
                        .collect()
                }),
            })
            .collect()
    }
}
