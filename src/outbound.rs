//! Hand-off of routed messages to the transport.
//!
//! A routed message is split into fragments when it exceeds the configured
//! fragment length, each fragment is encoded, and the frames are handed to
//! the transport in index order.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    codec::{FrameError, WireCodec},
    fragment::{FragmentationError, Fragmenter},
    id::PeerPointer,
    message::Message,
    transport::{SendMode, Transport, TransportError},
};

/// Reasons a routed message did not reach the transport.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error(transparent)]
    Fragmentation(#[from] FragmentationError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fragment → encode → transmit.
#[derive(Clone)]
pub struct Outbound {
    fragmenter: Fragmenter,
    codec: WireCodec,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("fragmenter", &self.fragmenter)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl Outbound {
    #[must_use]
    pub fn new(fragmenter: Fragmenter, codec: WireCodec, transport: Arc<dyn Transport>) -> Self {
        Self {
            fragmenter,
            codec,
            transport,
        }
    }

    /// Transmit `message` to `next_hop`, returning the number of frames sent.
    ///
    /// Every frame is encoded before the first is sent, so an encoding error
    /// never leaves a partial fragment series on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError`] when the message cannot be fragmented or
    /// encoded, or when the transport rejects a frame.
    pub async fn send(
        &self,
        next_hop: &PeerPointer,
        message: &Message,
        mode: SendMode,
    ) -> Result<usize, OutboundError> {
        let frames = self
            .fragmenter
            .fragment_message(message)?
            .iter()
            .map(|fragment| self.codec.encode(fragment))
            .collect::<Result<Vec<_>, _>>()?;
        let count = frames.len();
        for frame in frames {
            self.transport.send(next_hop, frame, mode).await?;
        }
        Ok(count)
    }
}
