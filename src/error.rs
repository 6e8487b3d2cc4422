use std::time::Duration;

use rmcp::model::ErrorData as McpError;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("invalid Home Assistant URL: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to WebSocket: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("timed out after {0:?} waiting for {1}")]
    AuthTimeout(Duration, &'static str),
    #[error("unexpected message during handshake: {0}")]
    Handshake(String),
    #[error("failed to send command {id}: {message}")]
    Send { id: u64, message: String },
    #[error("command {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },
    #[error("WebSocket connection closed")]
    Closed,
    #[error("Home Assistant returned {code}: {message}")]
    Remote { code: String, message: String },
}

// =============================================================================
// Client Errors
// =============================================================================

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("cannot connect to Home Assistant at '{0}'")]
    Connect(String),
    #[error("timeout connecting to Home Assistant at '{0}'")]
    Timeout(String),
    #[error("HTTP error {status} accessing {endpoint}: {message}")]
    Http {
        status: u16,
        endpoint: String,
        message: String,
    },
    #[error("Home Assistant API endpoint not found: {0}")]
    NotFound(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// Input Validation
// =============================================================================

/// A caller-supplied parameter that failed validation before any work started.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct InputError {
    pub field: String,
    pub message: String,
}

impl InputError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<InputError> for McpError {
    fn from(error: InputError) -> Self {
        McpError::invalid_params(error.to_string(), None)
    }
}
