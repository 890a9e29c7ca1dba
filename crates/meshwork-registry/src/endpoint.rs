//! Endpoints: the unit callers actually invoke
//!
//! An endpoint is a (node, service, action|event) triple. Its id is the node
//! id, so one endpoint list never holds two endpoints with the same id.

use crate::circuit_breaker::{CallOutcome, CircuitBreaker, CircuitState};
use crate::handler::{ActionHandler, EventHandler};
use crate::node::NodeId;
use crate::schema::{ActionSchema, EventSchema};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Common endpoint surface used by endpoint lists and strategies
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    /// Owning node; doubles as the endpoint id
    fn node_id(&self) -> &NodeId;

    fn is_local(&self) -> bool;

    /// Enabled and not blocked by a breaker
    fn is_available(&self) -> bool;

    /// Like [`is_available`](Self::is_available), but commits to sending a
    /// call here; a half-open breaker hands out its single trial
    fn acquire(&self) -> bool {
        self.is_available()
    }

    /// Full name of the owning service
    fn service(&self) -> &str;
}

/// Endpoint of one action on one node
#[derive(Debug)]
pub struct ActionEndpoint {
    node_id: NodeId,
    service: String,
    action: Arc<ActionSchema>,
    local: bool,
    state: AtomicBool,
    breaker: Option<CircuitBreaker>,
}

impl ActionEndpoint {
    pub fn new(
        node_id: NodeId,
        service: impl Into<String>,
        action: Arc<ActionSchema>,
        local: bool,
        breaker: Option<CircuitBreaker>,
    ) -> Self {
        Self {
            node_id,
            service: service.into(),
            action,
            local,
            state: AtomicBool::new(true),
            breaker,
        }
    }

    pub fn action(&self) -> &Arc<ActionSchema> {
        &self.action
    }

    pub fn name(&self) -> &str {
        &self.action.name
    }

    /// Local handler, if this endpoint lives in this process
    pub fn handler(&self) -> Option<&Arc<dyn ActionHandler>> {
        self.action.handler.as_ref()
    }

    /// Soft-enable or soft-disable the endpoint
    pub fn set_state(&self, enabled: bool) {
        self.state.store(enabled, Ordering::SeqCst);
    }

    /// Soft state, ignoring the breaker
    pub fn state(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    /// Breaker state; `Closed` when no breaker is attached
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker
            .as_ref()
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Feed a call outcome into the breaker
    pub fn record_outcome(&self, outcome: CallOutcome) {
        if let Some(ref breaker) = self.breaker {
            breaker.record(outcome);
        }
    }
}

impl Endpoint for ActionEndpoint {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn is_available(&self) -> bool {
        self.state() && self.breaker.as_ref().map_or(true, |b| b.is_passable())
    }

    fn acquire(&self) -> bool {
        self.state() && self.breaker.as_ref().map_or(true, |b| b.allows_request())
    }

    fn service(&self) -> &str {
        &self.service
    }
}

/// Endpoint of one event subscription on one node
#[derive(Debug)]
pub struct EventEndpoint {
    node_id: NodeId,
    service: String,
    event: Arc<EventSchema>,
    group: String,
    local: bool,
    state: AtomicBool,
}

impl EventEndpoint {
    /// `service_name` is the group when the schema declares none
    pub fn new(
        node_id: NodeId,
        service: impl Into<String>,
        service_name: &str,
        event: Arc<EventSchema>,
        local: bool,
    ) -> Self {
        let group = event
            .group
            .clone()
            .unwrap_or_else(|| service_name.to_string());
        Self {
            node_id,
            service: service.into(),
            event,
            group,
            local,
            state: AtomicBool::new(true),
        }
    }

    pub fn event(&self) -> &Arc<EventSchema> {
        &self.event
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn handler(&self) -> Option<&Arc<dyn EventHandler>> {
        self.event.handler.as_ref()
    }

    pub fn set_state(&self, enabled: bool) {
        self.state.store(enabled, Ordering::SeqCst);
    }
}

impl Endpoint for EventEndpoint {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn is_available(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    fn service(&self) -> &str {
        &self.service
    }
}
