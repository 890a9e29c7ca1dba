//! Local handler contracts
//!
//! Handlers are attached to local action and event schemas only. Remote
//! endpoints carry no handler; callers route them through the transport.

use crate::context::{Context, EventContext};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error returned by a business handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Error class; values >= 500 are server-class failures
    pub code: Option<u16>,
}

impl HandlerError {
    /// Create a handler error without a code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create a handler error with a code
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Local action handler
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, ctx: Context) -> Result<Value, HandlerError>;
}

/// Local event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext) -> Result<(), HandlerError>;
}
