//! Registry façade
//!
//! TigerStyle: One owner for every catalog, one lock around all of them.
//!
//! The registry keeps the node, service, action, and event catalogs
//! consistent while nodes join, re-announce, and disappear. All catalog
//! mutation happens under a single write lock, so a read-then-write never
//! straddles a suspension point; callers that do I/O between a read and a
//! write (the discoverer) use the re-validating operations here instead of
//! acting on stale snapshots.

use crate::action_catalog::{ActionCatalog, CatalogSettings};
use crate::circuit_breaker::CallOutcome;
use crate::context::{Context, EventContext};
use crate::endpoint::{ActionEndpoint, Endpoint, EventEndpoint};
use crate::error::{RegistryError, RegistryResult};
use crate::event_catalog::EventCatalog;
use crate::events::RegistryEvent;
use crate::handler::EventHandler;
use crate::introspection::{ActionRecord, EventRecord, ListOptions, NodeRecord, ServiceRecord};
use crate::node::NodeId;
use crate::node_catalog::{NodeCatalog, NodeInfoOutcome};
use crate::packet::{HeartbeatPayload, NodeInfo, ServiceInfo};
use crate::schema::{ActionSchema, EventSchema, ServiceDefinition, Visibility};
use crate::service::ServiceItem;
use crate::service_catalog::ServiceCatalog;
use crate::strategies::{LatencyProber, Pinger, ProbeTargets, ProberRole, StrategySpec};
use async_trait::async_trait;
use meshwork_core::config::{CircuitBreakerConfig, MeshConfig, RegistryConfig, StrategyConfig};
use meshwork_core::constants::{
    NAME_LENGTH_BYTES_MAX, PROTOCOL_VERSION, REGISTRY_EVENT_CHANNEL_CAPACITY,
    REGISTRY_NODES_COUNT_MAX, STRATEGY_LATENCY_COLLECT_COUNT_DEFAULT,
};
use meshwork_core::io::IoContext;
use meshwork_core::metrics;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Types
// =============================================================================

/// What the discoverer should do after a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Known, online, and up to date; liveness refreshed
    Refreshed,
    /// Unknown, offline, or out of date; pull the full INFO
    NeedsDiscovery,
}

struct RegistryState {
    nodes: NodeCatalog,
    services: ServiceCatalog,
    actions: ActionCatalog,
    events: EventCatalog,
    /// Local INFO must be regenerated before it is next handed out
    local_info_invalidated: bool,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Registry`]
pub struct RegistryBuilder {
    node_id: Option<NodeId>,
    instance_id: Option<String>,
    config: RegistryConfig,
    default_strategy: Option<StrategySpec>,
    circuit_breaker: CircuitBreakerConfig,
    metrics_enabled: bool,
    io: IoContext,
    latency: Option<Arc<LatencyProber>>,
    hostname: Option<String>,
    ip_list: Vec<String>,
    port: Option<u16>,
    metadata: Value,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            node_id: None,
            instance_id: None,
            config: RegistryConfig::default(),
            default_strategy: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            metrics_enabled: false,
            io: IoContext::production(),
            latency: None,
            hostname: None,
            ip_list: Vec::new(),
            port: None,
            metadata: Value::Null,
        }
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Default strategy for lists whose action declares none
    ///
    /// Overrides `config.strategy`; accepts custom factories.
    pub fn default_strategy(mut self, spec: StrategySpec) -> Self {
        self.default_strategy = Some(spec);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn io(mut self, io: IoContext) -> Self {
        self.io = io;
        self
    }

    /// Share a latency prober instead of creating a leader prober
    pub fn latency_prober(mut self, prober: Arc<LatencyProber>) -> Self {
        self.latency = Some(prober);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn ip_list(mut self, ip_list: Vec<String>) -> Self {
        self.ip_list = ip_list;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self) -> Registry {
        let node_id = self
            .node_id
            .unwrap_or_else(|| NodeId::generate(self.io.rng.as_ref()));
        let instance_id = self.instance_id.unwrap_or_else(|| self.io.gen_uuid());

        let collect_count = match self.config.strategy {
            StrategyConfig::Latency(ref opts) => opts.collect_count,
            _ => STRATEGY_LATENCY_COLLECT_COUNT_DEFAULT,
        };
        let latency = self
            .latency
            .unwrap_or_else(|| Arc::new(LatencyProber::new(ProberRole::Leader, collect_count)));

        let (events, _) = broadcast::channel(REGISTRY_EVENT_CHANNEL_CAPACITY);

        let default_strategy = self
            .default_strategy
            .unwrap_or_else(|| StrategySpec::Builtin(self.config.strategy.clone()));
        let latency_probe_interval_ms = match default_strategy {
            StrategySpec::Builtin(StrategyConfig::Latency(ref opts)) => Some(opts.ping_interval_ms),
            _ => None,
        };

        let settings = Arc::new(CatalogSettings {
            default_strategy,
            prefer_local: self.config.prefer_local,
            circuit_breaker: self.circuit_breaker,
            io: self.io.clone(),
            events: events.clone(),
            metrics_enabled: self.metrics_enabled,
            latency: Arc::clone(&latency),
        });

        let now_ms = self.io.monotonic_ms();
        let mut nodes = NodeCatalog::new(node_id.clone(), instance_id.clone(), now_ms);
        if let Some(local) = nodes.local_node_mut() {
            if self.hostname.is_some() {
                local.hostname = self.hostname;
            }
            local.ip_list = self.ip_list;
            local.port = self.port;
            local.metadata = self.metadata;
        }

        info!(node_id = %node_id, instance_id = %instance_id, "Registry created");

        Registry {
            local_node_id: node_id,
            instance_id,
            io: self.io,
            metrics_enabled: self.metrics_enabled,
            latency,
            latency_probe_interval_ms,
            events,
            state: RwLock::new(RegistryState {
                nodes,
                services: ServiceCatalog::new(),
                actions: ActionCatalog::new(Arc::clone(&settings)),
                events: EventCatalog::new(settings),
                local_info_invalidated: true,
            }),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The service registry of one process
pub struct Registry {
    local_node_id: NodeId,
    instance_id: String,
    io: IoContext,
    metrics_enabled: bool,
    latency: Arc<LatencyProber>,
    /// Set when the default strategy balances on measured latency
    latency_probe_interval_ms: Option<u64>,
    events: broadcast::Sender<RegistryEvent>,
    state: RwLock<RegistryState>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local_node_id", &self.local_node_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registry for a validated mesh configuration
    pub fn from_config(config: &MeshConfig, io: IoContext) -> RegistryResult<Self> {
        config.validate()?;

        let mut builder = RegistryBuilder::new()
            .config(config.registry.clone())
            .circuit_breaker(config.circuit_breaker.clone())
            .metrics_enabled(config.metrics_enabled)
            .io(io);
        if let Some(ref id) = config.node_id {
            builder = builder.node_id(NodeId::new(id.clone())?);
        }
        Ok(builder.build())
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn io(&self) -> &IoContext {
        &self.io
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    pub fn latency_prober(&self) -> &Arc<LatencyProber> {
        &self.latency
    }

    /// Lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Service registration
    // =========================================================================

    /// Register (or re-register) a service hosted by this process
    ///
    /// Private actions never enter the catalogs; protected ones are only
    /// reachable from this node.
    pub async fn register_local_service(
        &self,
        mut definition: ServiceDefinition,
    ) -> RegistryResult<()> {
        if definition.name.is_empty() || definition.name.len() > NAME_LENGTH_BYTES_MAX {
            return Err(RegistryError::invalid_payload(format!(
                "service name length must be in 1..={}",
                NAME_LENGTH_BYTES_MAX
            )));
        }
        definition.qualify_actions();

        let info = definition.to_info();
        let local_id = self.local_node_id.clone();
        let item = ServiceItem::new(local_id, &info, true);
        let full_name = item.full_name.clone();

        let actions: Vec<Arc<ActionSchema>> = definition
            .actions
            .into_iter()
            .filter(|a| Visibility::allows(a.visibility, true))
            .map(Arc::new)
            .collect();
        let events: Vec<Arc<EventSchema>> = definition.events.into_iter().map(Arc::new).collect();
        let (action_count, event_count) = (actions.len(), events.len());

        {
            let mut state = self.state.write().await;
            sync_service(&mut state, item, actions, events);
            state.local_info_invalidated = true;
        }

        info!(
            service = %full_name,
            actions = action_count,
            events = event_count,
            "Local service registered"
        );
        self.notify(RegistryEvent::ServicesChanged { local: true });
        Ok(())
    }

    /// Remove a local service and every endpoint it owns
    pub async fn unregister_local_service(&self, full_name: &str) -> RegistryResult<()> {
        {
            let mut state = self.state.write().await;
            if remove_service(&mut state, full_name, &self.local_node_id).is_none() {
                return Err(RegistryError::service_not_found(
                    full_name,
                    Some(self.local_node_id.as_str()),
                ));
            }
            state.local_info_invalidated = true;
        }

        info!(service = %full_name, "Local service unregistered");
        self.notify(RegistryEvent::ServicesChanged { local: true });
        Ok(())
    }

    /// Replace a remote node's service set, diffing against what it had
    pub async fn register_services(
        &self,
        node_id: &NodeId,
        services: &[ServiceInfo],
    ) -> RegistryResult<()> {
        if *node_id == self.local_node_id {
            return Err(RegistryError::invalid_payload(
                "remote registration for the local node",
            ));
        }

        {
            let mut state = self.state.write().await;
            if !state.nodes.has(node_id) {
                return Err(RegistryError::node_not_found(node_id.as_str()));
            }
            register_remote_services(&mut state, node_id, services);
        }

        self.notify(RegistryEvent::ServicesChanged { local: false });
        Ok(())
    }

    // =========================================================================
    // Node lifecycle
    // =========================================================================

    /// Apply a remote INFO payload
    pub async fn process_node_info(&self, info: NodeInfo) -> RegistryResult<NodeInfoOutcome> {
        if info.ver != PROTOCOL_VERSION {
            warn!(
                node_id = %info.sender,
                received = %info.ver,
                expected = PROTOCOL_VERSION,
                "Dropping INFO with incompatible protocol version"
            );
            return Err(RegistryError::ProtocolVersionMismatch {
                node_id: info.sender.to_string(),
                expected: PROTOCOL_VERSION.to_string(),
                received: info.ver,
            });
        }

        if info.sender == self.local_node_id {
            return Ok(NodeInfoOutcome::Unchanged);
        }

        let now_ms = self.io.monotonic_ms();
        let processed = {
            let mut state = self.state.write().await;
            if !state.nodes.has(&info.sender) && state.nodes.len() >= REGISTRY_NODES_COUNT_MAX {
                return Err(RegistryError::Internal {
                    message: format!("node limit {} reached", REGISTRY_NODES_COUNT_MAX),
                });
            }

            let processed = state.nodes.process_node_info(&info, now_ms);
            if processed.services_changed {
                register_remote_services(&mut state, &info.sender, &info.services);
            }
            processed
        };

        let node_id = info.sender;
        match processed.outcome {
            NodeInfoOutcome::Connected | NodeInfoOutcome::Reconnected => {
                let reconnected = processed.outcome == NodeInfoOutcome::Reconnected;
                info!(node_id = %node_id, reconnected, "Node connected");
                if self.metrics_enabled {
                    metrics::record_node_connected(reconnected);
                }
                self.notify(RegistryEvent::NodeConnected {
                    node_id,
                    reconnected,
                });
            }
            NodeInfoOutcome::Updated => {
                debug!(node_id = %node_id, "Node updated");
                self.notify(RegistryEvent::NodeUpdated { node_id });
            }
            NodeInfoOutcome::Unchanged => {}
        }

        if processed.services_changed {
            self.notify(RegistryEvent::ServicesChanged { local: false });
        }
        Ok(processed.outcome)
    }

    /// Apply a heartbeat, or ask for the full INFO when it cannot be trusted
    pub async fn heartbeat_received(&self, payload: &HeartbeatPayload) -> HeartbeatStatus {
        if payload.sender == self.local_node_id {
            return HeartbeatStatus::Refreshed;
        }

        let now_ms = self.io.monotonic_ms();
        let mut state = self.state.write().await;
        let node = match state.nodes.get_mut(&payload.sender) {
            Some(node) if node.available => node,
            _ => return HeartbeatStatus::NeedsDiscovery,
        };

        // KV backends announce a truncated instance hash
        let same_instance = node
            .instance_id
            .as_deref()
            .map_or(false, |id| id.starts_with(payload.instance_id.as_str()));
        if node.seq != payload.seq || !same_instance {
            debug!(
                node_id = %payload.sender,
                known_seq = node.seq,
                seq = payload.seq,
                "Heartbeat out of date"
            );
            return HeartbeatStatus::NeedsDiscovery;
        }

        node.heartbeat(payload, now_ms);
        HeartbeatStatus::Refreshed
    }

    /// Mark a remote node offline and drop everything it offered
    ///
    /// Returns `false` when the node is unknown, local, or already offline.
    pub async fn node_disconnected(&self, node_id: &NodeId, unexpected: bool) -> bool {
        let now_ms = self.io.monotonic_ms();
        let disconnected = {
            let mut state = self.state.write().await;
            disconnect_locked(&mut state, node_id, now_ms)
        };

        if disconnected {
            self.after_disconnect(node_id, unexpected);
        }
        disconnected
    }

    fn after_disconnect(&self, node_id: &NodeId, unexpected: bool) {
        if unexpected {
            warn!(node_id = %node_id, "Node disconnected unexpectedly");
        } else {
            info!(node_id = %node_id, "Node disconnected");
        }
        if self.metrics_enabled {
            metrics::record_node_disconnected(unexpected);
        }
        self.notify(RegistryEvent::NodeDisconnected {
            node_id: node_id.clone(),
            unexpected,
        });
        self.notify(RegistryEvent::ServicesChanged { local: false });
    }

    /// Available remote nodes whose last heartbeat is older than `timeout_ms`
    pub async fn stale_remote_nodes(&self, timeout_ms: u64) -> Vec<NodeId> {
        let now_ms = self.io.monotonic_ms();
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .filter(|n| !n.local && n.available && n.is_heartbeat_timeout(now_ms, timeout_ms))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Disconnect every stale remote node; the local node is never touched
    pub async fn check_remote_nodes(&self, timeout_ms: u64) -> Vec<NodeId> {
        let now_ms = self.io.monotonic_ms();
        let disconnected: Vec<NodeId> = {
            let mut state = self.state.write().await;
            let stale: Vec<NodeId> = state
                .nodes
                .iter()
                .filter(|n| !n.local && n.available && n.is_heartbeat_timeout(now_ms, timeout_ms))
                .map(|n| n.id.clone())
                .collect();
            stale
                .into_iter()
                .filter(|id| disconnect_locked(&mut state, id, now_ms))
                .collect()
        };

        for node_id in &disconnected {
            self.after_disconnect(node_id, true);
        }
        disconnected
    }

    /// Disconnect `node_id` only if it is still stale
    ///
    /// For callers that suspended on I/O after deciding the node was stale.
    pub async fn disconnect_node_if_stale(&self, node_id: &NodeId, timeout_ms: u64) -> bool {
        let now_ms = self.io.monotonic_ms();
        let disconnected = {
            let mut state = self.state.write().await;
            let still_stale = state.nodes.get(node_id).map_or(false, |n| {
                !n.local && n.available && n.is_heartbeat_timeout(now_ms, timeout_ms)
            });
            still_stale && disconnect_locked(&mut state, node_id, now_ms)
        };

        if disconnected {
            self.after_disconnect(node_id, true);
        }
        disconnected
    }

    /// Forget nodes offline for longer than `timeout_ms`
    pub async fn check_offline_nodes(&self, timeout_ms: u64) -> Vec<NodeId> {
        let now_ms = self.io.monotonic_ms();
        let removed: Vec<NodeId> = {
            let mut state = self.state.write().await;
            let expired: Vec<NodeId> = state
                .nodes
                .iter()
                .filter(|n| !n.local && n.is_offline_expired(now_ms, timeout_ms))
                .map(|n| n.id.clone())
                .collect();
            expired
                .into_iter()
                .filter(|id| {
                    remove_services_of_node(&mut state, id);
                    state.nodes.delete(id).is_some()
                })
                .collect()
        };

        for node_id in &removed {
            info!(node_id = %node_id, "Offline node removed");
            self.notify(RegistryEvent::NodeRemoved {
                node_id: node_id.clone(),
            });
        }
        removed
    }

    /// Remote nodes currently marked online
    pub async fn available_remote_nodes(&self) -> Vec<NodeId> {
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .filter(|n| !n.local && n.available)
            .map(|n| n.id.clone())
            .collect()
    }

    pub async fn has_node(&self, node_id: &NodeId) -> bool {
        self.state.read().await.nodes.has(node_id)
    }

    pub async fn is_node_available(&self, node_id: &NodeId) -> bool {
        let state = self.state.read().await;
        state.nodes.get(node_id).map_or(false, |n| n.available)
    }

    /// `(seq, instance_id)` cached for a node
    pub async fn node_version(&self, node_id: &NodeId) -> Option<(u64, Option<String>)> {
        let state = self.state.read().await;
        state
            .nodes
            .get(node_id)
            .map(|n| (n.seq, n.instance_id.clone()))
    }

    // =========================================================================
    // Local node
    // =========================================================================

    /// INFO payload describing this node
    ///
    /// Regenerated (and `seq` bumped once) only after a local change.
    pub async fn get_local_node_info(&self) -> NodeInfo {
        let mut state = self.state.write().await;
        let cached = state
            .nodes
            .local_node()
            .and_then(|n| n.raw_info.clone())
            .filter(|_| !state.local_info_invalidated);
        if let Some(info) = cached {
            return info;
        }

        let mut services: Vec<ServiceInfo> = state
            .services
            .by_node(&self.local_node_id)
            .map(ServiceItem::to_info)
            .collect();
        services.sort_by(|a, b| a.full_name.cmp(&b.full_name));

        state.local_info_invalidated = false;
        match state.nodes.local_node_mut() {
            Some(local) => {
                local.seq = local.seq.saturating_add(1);
                local.services = services.clone();

                let info = NodeInfo {
                    ip_list: local.ip_list.clone(),
                    hostname: local.hostname.clone(),
                    client: local.client.clone(),
                    config: local.config.clone(),
                    port: local.port,
                    seq: local.seq,
                    metadata: local.metadata.clone(),
                    services,
                    ..NodeInfo::new(self.local_node_id.clone(), self.instance_id.clone())
                };
                local.raw_info = Some(info.clone());
                debug!(seq = info.seq, "Local node info regenerated");
                info
            }
            None => NodeInfo::new(self.local_node_id.clone(), self.instance_id.clone()),
        }
    }

    /// Heartbeat payload for this node
    pub async fn local_heartbeat(&self) -> HeartbeatPayload {
        let state = self.state.read().await;
        let (cpu, seq) = state
            .nodes
            .local_node()
            .map_or((None, 0), |n| (n.cpu, n.seq));
        HeartbeatPayload {
            sender: self.local_node_id.clone(),
            cpu,
            seq,
            instance_id: self.instance_id.clone(),
        }
    }

    /// Record a fresh local CPU sample
    pub async fn update_local_cpu(&self, cpu: f64) {
        let now_ms = self.io.monotonic_ms();
        let mut state = self.state.write().await;
        if let Some(local) = state.nodes.local_node_mut() {
            local.cpu = Some(cpu);
            local.cpu_seq = local.cpu_seq.saturating_add(1);
            local.last_heartbeat_ms = now_ms;
        }
    }

    // =========================================================================
    // Action resolution
    // =========================================================================

    /// Resolve an action to one endpoint
    ///
    /// With `node_id`, only that node's endpoint is considered.
    pub async fn next_action_endpoint(
        &self,
        action: &str,
        call: Option<&Context>,
        node_id: Option<&NodeId>,
    ) -> RegistryResult<Arc<ActionEndpoint>> {
        let state = self.state.read().await;
        let list = state
            .actions
            .get(action)
            .ok_or_else(|| RegistryError::service_not_found(action, None))?;

        if let Some(node_id) = node_id {
            let endpoint = list
                .get_by_node_id(node_id)
                .ok_or_else(|| RegistryError::service_not_found(action, Some(node_id.as_str())))?;
            if !endpoint.acquire() {
                self.record_unavailable(action, "node");
                return Err(RegistryError::service_not_available(
                    action,
                    Some(node_id.as_str()),
                ));
            }
            return Ok(Arc::clone(endpoint));
        }

        match list.next(call, &state.nodes) {
            Some(endpoint) => Ok(endpoint),
            None => {
                self.record_unavailable(action, "all");
                Err(RegistryError::service_not_available(action, None))
            }
        }
    }

    fn record_unavailable(&self, action: &str, reason: &str) {
        debug!(action = %action, reason, "No available endpoint");
        if self.metrics_enabled {
            metrics::record_endpoint_unavailable(action, reason);
        }
    }

    /// Local endpoint of an action, if available
    pub async fn local_action_endpoint(&self, action: &str) -> Option<Arc<ActionEndpoint>> {
        let state = self.state.read().await;
        state.actions.get(action).and_then(|list| list.next_local())
    }

    /// Every endpoint of an action, available or not
    pub async fn action_endpoints(&self, action: &str) -> Vec<Arc<ActionEndpoint>> {
        let state = self.state.read().await;
        state
            .actions
            .get(action)
            .map(|list| list.endpoints().to_vec())
            .unwrap_or_default()
    }

    /// Soft-enable or soft-disable one endpoint
    pub async fn set_endpoint_state(
        &self,
        action: &str,
        node_id: &NodeId,
        enabled: bool,
    ) -> RegistryResult<()> {
        let endpoint = self.endpoint_of(action, node_id).await?;
        endpoint.set_state(enabled);
        debug!(action = %action, node_id = %node_id, enabled, "Endpoint state changed");
        Ok(())
    }

    /// Feed a call outcome into the endpoint's circuit breaker
    pub async fn report_action_outcome(
        &self,
        action: &str,
        node_id: &NodeId,
        outcome: CallOutcome,
    ) -> RegistryResult<()> {
        let endpoint = self.endpoint_of(action, node_id).await?;
        endpoint.record_outcome(outcome);
        Ok(())
    }

    async fn endpoint_of(&self, action: &str, node_id: &NodeId) -> RegistryResult<Arc<ActionEndpoint>> {
        let state = self.state.read().await;
        state
            .actions
            .get(action)
            .and_then(|list| list.get_by_node_id(node_id))
            .cloned()
            .ok_or_else(|| RegistryError::service_not_found(action, Some(node_id.as_str())))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// One endpoint per matching group
    pub async fn get_balanced_event_endpoints(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
    ) -> Vec<(Arc<EventEndpoint>, String)> {
        let state = self.state.read().await;
        state
            .events
            .get_balanced_endpoints(event_name, non_empty(groups), &state.nodes)
    }

    /// Every matching endpoint, one per node
    pub async fn get_all_event_endpoints(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
    ) -> Vec<Arc<EventEndpoint>> {
        let state = self.state.read().await;
        state.events.get_all_endpoints(event_name, non_empty(groups))
    }

    pub async fn get_event_groups(&self, event_name: &str) -> Vec<String> {
        self.state.read().await.events.get_groups(event_name)
    }

    /// Invoke the matching local handlers, one per targeted group
    ///
    /// Every handler runs to completion on its own task. Fails with the
    /// first failure when any handler failed.
    pub async fn emit_local_services(&self, ctx: EventContext) -> RegistryResult<()> {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let state = self.state.read().await;
            state
                .events
                .local_endpoints(&ctx.event_name, non_empty(ctx.groups.as_deref()))
                .iter()
                .filter_map(|ep| ep.handler().cloned())
                .collect()
        };

        if handlers.is_empty() {
            return Ok(());
        }

        let total = handlers.len();
        let tasks = handlers.into_iter().map(|handler| {
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.handle(ctx).await })
        });
        let results = futures::future::join_all(tasks).await;

        let mut failed = 0;
        let mut first = None;
        for result in results {
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.message,
                Err(e) => format!("handler task failed: {}", e),
            };
            failed += 1;
            first.get_or_insert(reason);
        }

        match first {
            None => Ok(()),
            Some(first) => {
                warn!(
                    event = %ctx.event_name,
                    failed,
                    total,
                    first = %first,
                    "Local event handlers failed"
                );
                Err(RegistryError::EmitFailed {
                    first,
                    failed,
                    total,
                })
            }
        }
    }

    /// Deliver an event to every matching local handler
    pub async fn broadcast_local(&self, event_name: &str, params: Value) -> RegistryResult<()> {
        let mut ctx = EventContext::broadcast(event_name, params);
        ctx.sender = Some(self.local_node_id.clone());
        self.emit_local_services(ctx).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn get_node_list(&self, opts: ListOptions) -> Vec<NodeRecord> {
        self.state.read().await.nodes.list(&opts)
    }

    pub async fn get_service_list(&self, opts: ListOptions) -> Vec<ServiceRecord> {
        let state = self.state.read().await;
        state.services.list(&opts, &state.nodes)
    }

    pub async fn get_action_list(&self, opts: ListOptions) -> Vec<ActionRecord> {
        self.state.read().await.actions.list(&opts)
    }

    pub async fn get_event_list(&self, opts: ListOptions) -> Vec<EventRecord> {
        self.state.read().await.events.list(&opts)
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Ping interval of the default latency strategy, if that is in use
    pub fn latency_probe_interval_ms(&self) -> Option<u64> {
        self.latency_probe_interval_ms
    }

    /// Start latency probing; a follower prober never pings
    pub fn start_latency_probing(self: &Arc<Self>, pinger: Arc<dyn Pinger>, interval_ms: u64) {
        let targets: Arc<dyn ProbeTargets> = Arc::clone(self) as Arc<dyn ProbeTargets>;
        self.latency
            .start(pinger, targets, self.io.time.clone(), interval_ms);
    }

    pub async fn stop_latency_probing(&self) {
        self.latency.stop().await;
    }

    /// Stop background work owned by the registry
    pub async fn stop(&self) {
        self.stop_latency_probing().await;
        info!(node_id = %self.local_node_id, "Registry stopped");
    }
}

#[async_trait]
impl ProbeTargets for Registry {
    async fn probe_targets(&self) -> Vec<(NodeId, String)> {
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .filter(|n| !n.local && n.available)
            .filter_map(|n| n.hostname.clone().map(|h| (n.id.clone(), h)))
            .collect()
    }
}

// =============================================================================
// Catalog bookkeeping (called under the write lock)
// =============================================================================

fn non_empty(groups: Option<&[String]>) -> Option<&[String]> {
    groups.filter(|g| !g.is_empty())
}

fn disconnect_locked(state: &mut RegistryState, node_id: &NodeId, now_ms: u64) -> bool {
    if !state.nodes.disconnected(node_id, now_ms) {
        return false;
    }
    remove_services_of_node(state, node_id);
    true
}

fn remove_services_of_node(state: &mut RegistryState, node_id: &NodeId) {
    for item in state.services.remove_all_by_node(node_id) {
        state.actions.remove_by_service(&item.full_name, node_id);
        state.events.remove_by_service(&item.full_name, node_id);
    }
}

fn remove_service(state: &mut RegistryState, full_name: &str, node_id: &NodeId) -> Option<ServiceItem> {
    let item = state.services.remove(full_name, node_id)?;
    for name in item.actions.keys() {
        state.actions.remove(name, node_id);
    }
    state.events.remove_by_service(full_name, node_id);
    Some(item)
}

fn register_remote_services(state: &mut RegistryState, node_id: &NodeId, services: &[ServiceInfo]) {
    let announced: HashSet<String> = services.iter().map(|s| s.resolved_full_name()).collect();
    let gone: Vec<String> = state
        .services
        .by_node(node_id)
        .filter(|s| !announced.contains(&s.full_name))
        .map(|s| s.full_name.clone())
        .collect();
    for full_name in gone {
        remove_service(state, &full_name, node_id);
    }

    for info in services {
        let item = ServiceItem::new(node_id.clone(), info, false);
        let actions = info
            .actions
            .values()
            .filter(|a| Visibility::allows(a.visibility, false))
            .map(|a| Arc::new(ActionSchema::from_info(a)))
            .collect();
        let events = info
            .events
            .values()
            .map(|e| Arc::new(EventSchema::from_info(e)))
            .collect();
        sync_service(state, item, actions, events);
    }
}

/// Install `item` with its actions and events, diffing against the
/// previous item for the same (service, node)
///
/// Unchanged remote schemas keep their endpoints, and with them any
/// circuit-breaker state; names no longer offered are unregistered.
fn sync_service(
    state: &mut RegistryState,
    mut item: ServiceItem,
    actions: Vec<Arc<ActionSchema>>,
    events: Vec<Arc<EventSchema>>,
) {
    let node_id = item.node_id.clone();
    let previous = state.services.remove(&item.full_name, &node_id);
    let (old_actions, old_events) = match previous {
        Some(prev) => (prev.actions, prev.events),
        None => Default::default(),
    };

    for action in actions {
        let unchanged = !item.local
            && old_actions
                .get(&action.name)
                .map_or(false, |old| old.to_info() == action.to_info())
            && state
                .actions
                .get(&action.name)
                .map_or(false, |list| list.get_by_node_id(&node_id).is_some());
        if !unchanged {
            state.actions.add(&node_id, &item, Arc::clone(&action));
        }
        let kept = match old_actions.get(&action.name) {
            Some(old) if unchanged => Arc::clone(old),
            _ => action,
        };
        item.actions.insert(kept.name.clone(), kept);
    }
    for name in old_actions.keys() {
        if !item.actions.contains_key(name) {
            state.actions.remove(name, &node_id);
        }
    }

    for event in events {
        state.events.add(&node_id, &item, Arc::clone(&event));
        item.events.insert(event.name.clone(), event);
    }
    for name in old_events.keys() {
        if !item.events.contains_key(name) {
            state.events.remove(name, &item.full_name, &node_id);
        }
    }

    state.services.insert(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ActionHandler, HandlerError};
    use async_trait::async_trait;
    use meshwork_core::io::ManualClock;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn call(&self, ctx: Context) -> Result<Value, HandlerError> {
            Ok(ctx.params)
        }
    }

    fn registry(clock: Arc<ManualClock>) -> Registry {
        Registry::builder()
            .node_id(NodeId::new("node-a").unwrap())
            .instance_id("inst-a")
            .io(IoContext::for_testing(clock, 42))
            .build()
    }

    fn users_info(sender: &str, seq: u64, actions: &[&str]) -> NodeInfo {
        let mut def = ServiceDefinition::new("users");
        for action in actions {
            def = def.with_action(ActionSchema::new(*action));
        }
        let mut info = NodeInfo::new(NodeId::new(sender).unwrap(), format!("inst-{}", sender));
        info.seq = seq;
        info.hostname = Some(format!("host-{}", sender));
        info.services = vec![def.to_info()];
        info
    }

    #[tokio::test]
    async fn test_local_info_seq_bumps_once_per_change() {
        let registry = registry(Arc::new(ManualClock::new(0)));

        let first = registry.get_local_node_info().await;
        let again = registry.get_local_node_info().await;
        assert_eq!(first.seq, 1);
        assert_eq!(again.seq, 1);

        registry
            .register_local_service(
                ServiceDefinition::new("math")
                    .with_action(ActionSchema::new("add").with_handler(Arc::new(Echo)))
                    .with_action(ActionSchema::new("hidden").with_visibility(Visibility::Private)),
            )
            .await
            .unwrap();

        let info = registry.get_local_node_info().await;
        assert_eq!(info.seq, 2);
        assert_eq!(info.services.len(), 1);
        assert!(info.services[0].actions.contains_key("math.add"));
        assert!(!info.services[0].actions.contains_key("math.hidden"));

        let heartbeat = registry.local_heartbeat().await;
        assert_eq!(heartbeat.seq, 2);
        assert_eq!(heartbeat.instance_id, "inst-a");
    }

    #[tokio::test]
    async fn test_versioned_service_resolves_by_full_name() {
        let registry = registry(Arc::new(ManualClock::new(0)));
        let mut def = ServiceDefinition::new("users")
            .with_action(ActionSchema::new("find").with_handler(Arc::new(Echo)))
            .with_version(crate::service::ServiceVersion::Number(2));
        def.actions
            .push(ActionSchema::new("count").with_handler(Arc::new(Echo)));
        registry.register_local_service(def).await.unwrap();

        assert!(registry.local_action_endpoint("v2.users.find").await.is_some());
        assert!(registry.local_action_endpoint("v2.users.count").await.is_some());
        assert!(registry.local_action_endpoint("users.find").await.is_none());

        let info = registry.get_local_node_info().await;
        assert!(info.services[0].actions.contains_key("v2.users.find"));
        assert!(info.services[0].actions.contains_key("v2.users.count"));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_rejected() {
        let registry = registry(Arc::new(ManualClock::new(0)));
        let mut info = users_info("node-b", 1, &["find"]);
        info.ver = "3".into();

        let err = registry.process_node_info(info).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProtocolVersionMismatch { .. }));
        assert!(!registry.has_node(&NodeId::new("node-b").unwrap()).await);
    }

    #[tokio::test]
    async fn test_remote_service_diff() {
        let registry = registry(Arc::new(ManualClock::new(0)));
        registry
            .process_node_info(users_info("node-b", 1, &["find", "remove"]))
            .await
            .unwrap();
        assert!(registry
            .next_action_endpoint("users.remove", None, None)
            .await
            .is_ok());

        let outcome = registry
            .process_node_info(users_info("node-b", 2, &["find"]))
            .await
            .unwrap();
        assert_eq!(outcome, NodeInfoOutcome::Updated);

        let err = registry
            .next_action_endpoint("users.remove", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ServiceNotFound { .. }));
        assert!(registry
            .next_action_endpoint("users.find", None, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_status() {
        let registry = registry(Arc::new(ManualClock::new(0)));
        let b = NodeId::new("node-b").unwrap();
        let beat = |seq: u64, instance: &str| HeartbeatPayload {
            sender: b.clone(),
            cpu: Some(12.0),
            seq,
            instance_id: instance.to_string(),
        };

        assert_eq!(
            registry.heartbeat_received(&beat(1, "inst-node-b")).await,
            HeartbeatStatus::NeedsDiscovery
        );

        registry
            .process_node_info(users_info("node-b", 1, &["find"]))
            .await
            .unwrap();
        assert_eq!(
            registry.heartbeat_received(&beat(1, "inst-node-b")).await,
            HeartbeatStatus::Refreshed
        );
        // Truncated instance hash still matches
        assert_eq!(
            registry.heartbeat_received(&beat(1, "inst-no")).await,
            HeartbeatStatus::Refreshed
        );
        assert_eq!(
            registry.heartbeat_received(&beat(2, "inst-node-b")).await,
            HeartbeatStatus::NeedsDiscovery
        );
        assert_eq!(
            registry.heartbeat_received(&beat(1, "other")).await,
            HeartbeatStatus::NeedsDiscovery
        );
    }

    #[tokio::test]
    async fn test_node_targeted_resolution() {
        let registry = registry(Arc::new(ManualClock::new(0)));
        registry
            .process_node_info(users_info("node-b", 1, &["find"]))
            .await
            .unwrap();
        let b = NodeId::new("node-b").unwrap();
        let c = NodeId::new("node-c").unwrap();

        let ep = registry
            .next_action_endpoint("users.find", None, Some(&b))
            .await
            .unwrap();
        assert_eq!(ep.node_id(), &b);

        let err = registry
            .next_action_endpoint("users.find", None, Some(&c))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::service_not_found("users.find", Some("node-c")));

        registry.set_endpoint_state("users.find", &b, false).await.unwrap();
        let err = registry
            .next_action_endpoint("users.find", None, Some(&b))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_disconnect_drops_endpoints_and_offline_cleanup() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = registry(clock.clone());
        let b = NodeId::new("node-b").unwrap();
        registry
            .process_node_info(users_info("node-b", 1, &["find"]))
            .await
            .unwrap();

        let mut events = registry.subscribe();
        assert!(registry.node_disconnected(&b, false).await);
        assert!(!registry.node_disconnected(&b, false).await);
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::NodeDisconnected {
                node_id: b.clone(),
                unexpected: false
            }
        );

        let err = registry
            .next_action_endpoint("users.find", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ServiceNotAvailable { .. }));

        clock.advance_ms(1_000);
        assert!(registry.check_offline_nodes(5_000).await.is_empty());
        clock.advance_ms(10_000);
        assert_eq!(registry.check_offline_nodes(5_000).await, vec![b.clone()]);
        assert!(!registry.has_node(&b).await);
    }

    #[tokio::test]
    async fn test_builder_from_config() {
        let config = MeshConfig::for_testing();
        let registry =
            Registry::from_config(&config, IoContext::for_testing(Arc::new(ManualClock::new(0)), 1))
                .unwrap();
        assert_eq!(registry.local_node_id().as_str(), "test-node");

        let nodes = registry.get_node_list(ListOptions::default()).await;
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].local);

        let info = registry.get_local_node_info().await;
        assert_eq!(info.ver, PROTOCOL_VERSION);
        assert_eq!(json!(info.sender), json!("test-node"));
    }
}
