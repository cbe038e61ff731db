//! Service Error Types
//!
//! Business-rule errors raised above the storage layer. Storage failures
//! arrive wrapped in `Persistence`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatServiceError {
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Topic not found: {id}")]
    TopicNotFound { id: String },

    /// The request is well-formed but violates a tree rule (wrong node kind,
    /// cross-session parent, content edit on an immutable kind, ...).
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// The completion provider failed before or during generation.
    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl ChatServiceError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    pub fn topic_not_found(id: impl Into<String>) -> Self {
        Self::TopicNotFound { id: id.into() }
    }

    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}
