// Error types for the tracing core
//
// None of these ever reach the host's business logic. Tree misuse is absorbed
// and logged in debug mode, delivery failures drive the retry/drop policy,
// and plugin failures are isolated by the hub.

use thiserror::Error;

/// Result type alias for tracing operations
pub type Result<T> = std::result::Result<T, TracerError>;

/// Errors that can occur inside the tracing core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TracerError {
    /// A child was attached to a node that is not open in this tree
    #[error("Invalid parent: {parent_id} is not an open node")]
    InvalidParent { parent_id: String },

    /// A node was closed twice
    #[error("Node already closed: {id}")]
    AlreadyClosed { id: String },

    /// A node id was never attached to this tree
    #[error("Unknown node: {id}")]
    UnknownNode { id: String },

    /// Retryable delivery failure (transport error, 5xx, 429)
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    /// Non-retryable delivery failure (rejected or malformed payload)
    #[error("Permanent delivery failure ({status:?}): {message}")]
    PermanentDelivery {
        status: Option<u16>,
        message: String,
    },

    /// A plugin hook returned an error, panicked, or timed out
    #[error("Plugin {plugin} failed in {hook}: {message}")]
    PluginHookFailure {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    /// The traced operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TracerError {
    /// Create an invalid parent error
    pub fn invalid_parent(parent_id: impl Into<String>) -> Self {
        TracerError::InvalidParent {
            parent_id: parent_id.into(),
        }
    }

    /// Create an already closed error
    pub fn already_closed(id: impl Into<String>) -> Self {
        TracerError::AlreadyClosed { id: id.into() }
    }

    /// Create an unknown node error
    pub fn unknown_node(id: impl Into<String>) -> Self {
        TracerError::UnknownNode { id: id.into() }
    }

    /// Create a transient delivery error
    pub fn transient(msg: impl Into<String>) -> Self {
        TracerError::TransientDelivery(msg.into())
    }

    /// Create a permanent delivery error
    pub fn permanent(status: Option<u16>, msg: impl Into<String>) -> Self {
        TracerError::PermanentDelivery {
            status,
            message: msg.into(),
        }
    }

    /// Create a plugin hook failure
    pub fn plugin(plugin: impl Into<String>, hook: &'static str, msg: impl Into<String>) -> Self {
        TracerError::PluginHookFailure {
            plugin: plugin.into(),
            hook,
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TracerError::Config(msg.into())
    }

    /// Whether a delivery should be retried after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, TracerError::TransientDelivery(_))
    }

    /// Whether this error is programmer misuse of the tree model
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TracerError::InvalidParent { .. }
                | TracerError::AlreadyClosed { .. }
                | TracerError::UnknownNode { .. }
        )
    }
}

impl From<serde_json::Error> for TracerError {
    fn from(err: serde_json::Error) -> Self {
        TracerError::Serialization(err.to_string())
    }
}
