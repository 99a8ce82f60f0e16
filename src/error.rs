//! Canonical error and result types for the crate.
//!
//! Dropped messages are never errors: they are logged, counted and, for
//! tracked messages, reported through delivery callbacks. `OverlayError`
//! covers what a caller must act on: a configuration the node cannot start
//! with, and a transport that has shut down underneath it.

use thiserror::Error;

use crate::{config::ConfigError, transport::{QueueConfigError, TransportError}};

/// Top-level error type exposed by `hyperroute`.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The outbound queue could not be built.
    #[error("invalid outbound queue: {0}")]
    Queue(#[from] QueueConfigError),
    /// The transport refused work; [`TransportError::Closed`] means the host
    /// is shutting down.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The node has been shut down.
    #[error("node is shut down")]
    ShutDown,
}

impl OverlayError {
    /// Whether this error means the node or its host is going away.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutDown | Self::Transport(TransportError::Closed))
    }
}

/// Canonical result alias used by `hyperroute` public APIs.
pub type Result<T> = std::result::Result<T, OverlayError>;
