//! Discovery error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! Store and transport failures never escape a timer callback; the
//! discoverer logs them and the next cycle retries.

use meshwork_registry::{NodeId, RegistryError};
use thiserror::Error;

/// Discovery-specific errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Discoverer already started
    #[error("discoverer already started")]
    AlreadyStarted,

    /// Discoverer not started
    #[error("discoverer not started")]
    NotStarted,

    /// Key-value store operation failed
    #[error("store {operation} failed: {reason}")]
    Store { operation: String, reason: String },

    /// Packet could not be delivered
    #[error("transport to {target} failed: {reason}")]
    Transport { target: String, reason: String },

    /// Payload could not be encoded or decoded
    #[error("serialization failed: {reason}")]
    Serialization { reason: String },

    /// Backend compiled out or not reachable
    #[error("discovery backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] meshwork_core::Error),
}

impl DiscoveryError {
    /// Create a store error
    pub fn store(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a transport error for a single target
    pub fn transport(target: &NodeId, reason: impl Into<String>) -> Self {
        Self::Transport {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl ToString) -> Self {
        Self::Serialization {
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Transport { .. })
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;
