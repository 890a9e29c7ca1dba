//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! Resolution failures are ordinary, recoverable outcomes: `ServiceNotFound`
//! is permanent until a matching service registers, `ServiceNotAvailable`
//! is transient and may clear on the next heartbeat.

use thiserror::Error;

/// Registry-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// No endpoint list exists for the name, or the requested node holds none
    #[error("service not found: {action}{}", node_suffix(.node_id))]
    ServiceNotFound {
        action: String,
        node_id: Option<String>,
    },

    /// Endpoints exist but none is currently available
    #[error("service not available: {action}{}", node_suffix(.node_id))]
    ServiceNotAvailable {
        action: String,
        node_id: Option<String>,
    },

    /// Announce payload speaks an incompatible protocol
    #[error("protocol version mismatch from node {node_id}: expected {expected}, received {received}")]
    ProtocolVersionMismatch {
        node_id: String,
        expected: String,
        received: String,
    },

    /// Node not known to the registry
    #[error("node not found: {node_id}")]
    NodeNotFound { node_id: String },

    /// Invalid node ID
    #[error("invalid node ID: {id}, reason: {reason}")]
    InvalidNodeId { id: String, reason: String },

    /// Invalid registration or payload content
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// A local handler returned an error
    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String, code: Option<u16> },

    /// One or more local event handlers failed during fan-out
    #[error("{failed} of {total} event handlers failed, first: {first}")]
    EmitFailed {
        first: String,
        failed: usize,
        total: usize,
    },

    /// Internal registry error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn node_suffix(node_id: &Option<String>) -> String {
    match node_id {
        Some(id) => format!(" on node {}", id),
        None => String::new(),
    }
}

impl RegistryError {
    /// Create a service not found error
    pub fn service_not_found(action: impl Into<String>, node_id: Option<&str>) -> Self {
        Self::ServiceNotFound {
            action: action.into(),
            node_id: node_id.map(str::to_string),
        }
    }

    /// Create a service not available error
    pub fn service_not_available(action: impl Into<String>, node_id: Option<&str>) -> Self {
        Self::ServiceNotAvailable {
            action: action.into(),
            node_id: node_id.map(str::to_string),
        }
    }

    /// Create a node not found error
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound {
            node_id: node_id.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ServiceNotAvailable { .. })
    }
}

impl From<meshwork_core::Error> for RegistryError {
    fn from(err: meshwork_core::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
