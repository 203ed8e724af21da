//! Protocol error taxonomy
//!
//! Every layer operation returns [`Result`]. Callers capability-check
//! before invoking optional layers; adapters fail fast with
//! [`ProtocolError::Unsupported`] instead of silently doing nothing.

use crate::types::Conflict;

/// Errors surfaced by any capability layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Unknown snapshot, branch or overlay reference.
    #[error("not found: {reference}")]
    NotFound { reference: String },

    /// Capability bit unset, or an optional operation with no fallback.
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Merge or merge-down could not be resolved automatically.
    #[error("merge conflict on {} path(s)", conflicts.len())]
    Conflict { conflicts: Vec<Conflict> },

    /// Operation not valid in the current state (terminal overlay, current branch, ...).
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// Opaque failure from the backing engine.
    #[error("backing engine failure: {message}")]
    Underlying {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProtocolError {
    pub fn not_found(reference: impl Into<String>) -> Self {
        Self::NotFound {
            reference: reference.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Wrap an engine error, keeping it as the source.
    pub fn underlying<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Underlying {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for `Unsupported`.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Conflict list carried by a `Conflict` error.
    pub fn conflicts(&self) -> Option<&[Conflict]> {
        match self {
            Self::Conflict { conflicts } => Some(conflicts),
            _ => None,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result alias used across all layers.
pub type Result<T> = std::result::Result<T, ProtocolError>;
