//! Frame transmission.
//!
//! Sockets are the host's concern; the node only needs something that can
//! carry an encoded frame to a peer. [`OutboundQueues`] sits between the node
//! and that transport, bounding and optionally pacing outbound traffic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::id::PeerPointer;

mod queue;

pub use queue::{
    Datagram,
    MAX_OUTBOUND_RATE,
    OutboundHandle,
    OutboundQueues,
    OutboundQueuesBuilder,
    QueueConfigError,
};

/// Behaviour when the transport cannot accept a frame immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendMode {
    /// Await capacity.
    #[default]
    Wait,
    /// Fail with [`TransportError::Full`] instead of waiting.
    NoWait,
}

impl SendMode {
    #[must_use]
    pub const fn from_wait(wait: bool) -> Self { if wait { Self::Wait } else { Self::NoWait } }
}

/// Errors reported by a [`Transport`].
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No capacity was available and the caller asked not to wait.
    #[error("transport queue full")]
    Full,
    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
    /// The peer address cannot be reached.
    #[error("peer {0} unreachable")]
    Unreachable(String),
}

/// Carries encoded frames to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `frame` over for delivery to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Full`] when `mode` is [`SendMode::NoWait`]
    /// and no capacity is available, and [`TransportError::Closed`] when the
    /// transport has shut down.
    async fn send(&self, to: &PeerPointer, frame: Bytes, mode: SendMode)
    -> Result<(), TransportError>;
}
