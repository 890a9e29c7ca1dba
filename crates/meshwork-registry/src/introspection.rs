//! Plain descriptive records returned by the registry's list calls
//!
//! These never hold live references; they are snapshots suitable for a
//! control-plane service, a REPL, or an HTTP introspection endpoint.

use crate::circuit_breaker::CircuitState;
use crate::packet::ClientInfo;
use crate::schema::Visibility;
use crate::service::ServiceVersion;
use serde::Serialize;
use serde_json::Value;

/// Filters shared by all list calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub only_local: bool,
    pub only_available: bool,
    /// Hide names starting with the internal prefix
    pub skip_internal: bool,
    pub with_actions: bool,
    pub with_events: bool,
    pub with_endpoints: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub instance_id: Option<String>,
    pub available: bool,
    pub local: bool,
    pub seq: u64,
    pub cpu: Option<f64>,
    pub hostname: Option<String>,
    pub ip_list: Vec<String>,
    pub port: Option<u16>,
    pub client: ClientInfo,
    pub last_heartbeat_ms: u64,
    pub offline_since_ms: Option<u64>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub version: Option<ServiceVersion>,
    pub full_name: String,
    pub node_id: String,
    pub local: bool,
    pub available: bool,
    pub settings: Value,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub node_id: String,
    pub service: String,
    pub local: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub name: String,
    pub visibility: Option<Visibility>,
    pub strategy: String,
    pub count: usize,
    pub has_local: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub name: String,
    pub group: String,
    pub count: usize,
    pub has_local: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointRecord>>,
}

pub(crate) fn circuit_label(state: CircuitState) -> &'static str {
    state.as_str()
}
