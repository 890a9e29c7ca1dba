//! Call contexts passed to strategies and handlers

use crate::node::NodeId;
use serde_json::Value;

/// Context of one action call
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub params: Value,
    pub meta: Value,
    /// Node that issued the call, if remote
    pub caller: Option<NodeId>,
}

impl Context {
    /// Context with params and empty meta
    pub fn new(params: Value) -> Self {
        Self {
            params,
            meta: Value::Null,
            caller: None,
        }
    }

    /// Attach meta
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// Look up a dotted path; a leading `#` reads from meta instead of params
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        match path.strip_prefix('#') {
            Some(meta_path) => lookup_path(&self.meta, meta_path),
            None => lookup_path(&self.params, path),
        }
    }
}

/// Context of one event delivery
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub event_name: String,
    pub params: Value,
    pub meta: Value,
    /// Restrict delivery to these groups; `None` means every group
    pub groups: Option<Vec<String>>,
    /// Deliver to every matching local endpoint instead of one per group
    pub broadcast: bool,
    pub sender: Option<NodeId>,
}

impl EventContext {
    /// Balanced emit of `event_name`
    pub fn emit(event_name: impl Into<String>, params: Value) -> Self {
        Self {
            event_name: event_name.into(),
            params,
            ..Default::default()
        }
    }

    /// Broadcast of `event_name`
    pub fn broadcast(event_name: impl Into<String>, params: Value) -> Self {
        Self {
            event_name: event_name.into(),
            params,
            broadcast: true,
            ..Default::default()
        }
    }

    /// Restrict to groups
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Whether this delivery targets `group`
    pub fn targets_group(&self, group: &str) -> bool {
        match self.groups {
            Some(ref groups) if !groups.is_empty() => groups.iter().any(|g| g == group),
            _ => true,
        }
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
