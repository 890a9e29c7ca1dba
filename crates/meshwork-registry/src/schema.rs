//! Action and event schemas, and local service definitions

use crate::handler::{ActionHandler, EventHandler};
use crate::packet::{ActionInfo, EventInfo, ServiceInfo};
use crate::service::{service_full_name, ServiceVersion};
use crate::strategies::StrategySpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Who may call an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Public and advertised to gateways
    Published,
    /// Callable from any node
    Public,
    /// Callable only from the local node
    Protected,
    /// Never reachable through the registry
    Private,
}

impl Visibility {
    /// Whether an action with this visibility is registered for `node`
    ///
    /// `None` behaves like `Published`.
    pub fn allows(visibility: Option<Visibility>, node_is_local: bool) -> bool {
        match visibility {
            None | Some(Visibility::Published) | Some(Visibility::Public) => true,
            Some(Visibility::Protected) => node_is_local,
            Some(Visibility::Private) => false,
        }
    }
}

/// Action schema as held by the catalogs
#[derive(Clone)]
pub struct ActionSchema {
    /// Qualified name, `{service full name}.{raw name}`
    pub name: String,
    pub raw_name: String,
    pub visibility: Option<Visibility>,
    pub params: Option<Value>,
    pub metadata: Value,
    pub strategy: Option<StrategySpec>,
    pub handler: Option<Arc<dyn ActionHandler>>,
}

impl fmt::Debug for ActionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSchema")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("strategy", &self.strategy)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl ActionSchema {
    /// Unqualified action; the name is qualified when its service registers
    pub fn new(raw_name: impl Into<String>) -> Self {
        let raw_name = raw_name.into();
        Self {
            name: raw_name.clone(),
            raw_name,
            visibility: None,
            params: None,
            metadata: Value::Null,
            strategy: None,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategySpec) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Schema for a remote action; carries no handler
    pub fn from_info(info: &ActionInfo) -> Self {
        Self {
            name: info.name.clone(),
            raw_name: info.raw_name.clone(),
            visibility: info.visibility,
            params: info.params.clone(),
            metadata: info.metadata.clone(),
            strategy: info.strategy.clone().map(StrategySpec::Builtin),
            handler: None,
        }
    }

    /// Public schema for INFO packets
    pub fn to_info(&self) -> ActionInfo {
        ActionInfo {
            name: self.name.clone(),
            raw_name: self.raw_name.clone(),
            visibility: self.visibility,
            params: self.params.clone(),
            strategy: self.strategy.as_ref().and_then(StrategySpec::builtin_config),
            metadata: self.metadata.clone(),
        }
    }
}

/// Event subscription schema
#[derive(Clone)]
pub struct EventSchema {
    /// Event name or pattern (`*`, `**`, `?` wildcards)
    pub name: String,
    /// Load-balancing group; defaults to the owning service name
    pub group: Option<String>,
    pub metadata: Value,
    pub handler: Option<Arc<dyn EventHandler>>,
}

impl fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSchema")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl EventSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            metadata: Value::Null,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Schema for a remote subscription; carries no handler
    pub fn from_info(info: &EventInfo) -> Self {
        Self {
            name: info.name.clone(),
            group: info.group.clone(),
            metadata: info.metadata.clone(),
            handler: None,
        }
    }

    /// Public schema for INFO packets
    pub fn to_info(&self) -> EventInfo {
        EventInfo {
            name: self.name.clone(),
            group: self.group.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Definition of a service hosted by the local node
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub version: Option<ServiceVersion>,
    pub settings: Value,
    pub metadata: Value,
    pub dependencies: Vec<String>,
    pub actions: Vec<ActionSchema>,
    pub events: Vec<EventSchema>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            settings: Value::Null,
            metadata: Value::Null,
            dependencies: Vec::new(),
            actions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: ServiceVersion) -> Self {
        self.version = Some(version);
        self.qualify_actions();
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Add an action; its name is qualified with the service full name
    pub fn with_action(mut self, action: ActionSchema) -> Self {
        self.actions.push(action);
        self.qualify_actions();
        self
    }

    pub fn with_event(mut self, event: EventSchema) -> Self {
        self.events.push(event);
        self
    }

    pub fn full_name(&self) -> String {
        service_full_name(&self.name, self.version.as_ref())
    }

    /// Rewrite every action name as `{full_name}.{raw_name}`
    ///
    /// Names derive from the current name and version, so the builder
    /// calls may come in any order and `actions` may be filled directly.
    pub fn qualify_actions(&mut self) {
        let full_name = self.full_name();
        for action in &mut self.actions {
            action.name = format!("{}.{}", full_name, action.raw_name);
        }
    }

    /// Public description, excluding private actions
    pub fn to_info(&self) -> ServiceInfo {
        let full_name = self.full_name();
        let mut info = ServiceInfo::new(self.name.clone(), self.version.clone());
        info.settings = self.settings.clone();
        info.metadata = self.metadata.clone();
        info.dependencies = self.dependencies.clone();
        info.actions = self
            .actions
            .iter()
            .filter(|a| a.visibility != Some(Visibility::Private))
            .map(|a| {
                let mut action = a.to_info();
                action.name = format!("{}.{}", full_name, a.raw_name);
                (action.name.clone(), action)
            })
            .collect();
        info.events = self
            .events
            .iter()
            .map(|e| (e.name.clone(), e.to_info()))
            .collect();
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_core::config::StrategyConfig;

    #[test]
    fn test_visibility_rules() {
        assert!(Visibility::allows(None, false));
        assert!(Visibility::allows(Some(Visibility::Published), false));
        assert!(Visibility::allows(Some(Visibility::Public), false));
        assert!(Visibility::allows(Some(Visibility::Protected), true));
        assert!(!Visibility::allows(Some(Visibility::Protected), false));
        assert!(!Visibility::allows(Some(Visibility::Private), true));
    }

    #[test]
    fn test_definition_qualifies_action_names() {
        let def = ServiceDefinition::new("users")
            .with_version(ServiceVersion::Number(2))
            .with_action(ActionSchema::new("find"))
            .with_action(ActionSchema::new("secret").with_visibility(Visibility::Private));

        assert_eq!(def.actions[0].name, "v2.users.find");
        let info = def.to_info();
        assert_eq!(info.full_name, "v2.users");
        assert!(info.actions.contains_key("v2.users.find"));
        assert!(!info.actions.contains_key("v2.users.secret"));
    }

    #[test]
    fn test_action_names_follow_late_version() {
        let mut def = ServiceDefinition::new("users")
            .with_action(ActionSchema::new("find"))
            .with_version(ServiceVersion::Number(2));
        def.actions.push(ActionSchema::new("count"));

        assert_eq!(def.actions[0].name, "v2.users.find");
        let info = def.to_info();
        assert!(info.actions.contains_key("v2.users.find"));
        assert_eq!(info.actions["v2.users.count"].name, "v2.users.count");
        assert!(!info.actions.contains_key("users.find"));
    }

    #[test]
    fn test_action_info_carries_builtin_strategy() {
        let action = ActionSchema::new("find").with_strategy(StrategySpec::Builtin(
            StrategyConfig::Random,
        ));
        let info = action.to_info();
        assert_eq!(info.strategy, Some(StrategyConfig::Random));

        let remote = ActionSchema::from_info(&info);
        assert!(remote.handler.is_none());
        assert!(matches!(
            remote.strategy,
            Some(StrategySpec::Builtin(StrategyConfig::Random))
        ));
    }
}
