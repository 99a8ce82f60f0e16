//! Bounded, optionally rate-paced outbound queue.
//!
//! [`OutboundHandle`] implements [`Transport`] for the node; the paired
//! [`OutboundQueues`] receiver is drained by a pump task forwarding each
//! [`Datagram`] to the host transport. An optional rate limiter caps
//! throughput at a number of frames per second.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use leaky_bucket::RateLimiter;
use log::debug;
use static_assertions::const_assert;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{SendMode, Transport, TransportError};
use crate::id::PeerPointer;

/// Highest supported rate for [`OutboundQueuesBuilder::rate`].
pub const MAX_OUTBOUND_RATE: usize = 100_000;
const DEFAULT_CAPACITY: usize = 1024;

const_assert!(DEFAULT_CAPACITY > 0);

/// An encoded frame addressed to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub to: PeerPointer,
    pub frame: Bytes,
}

/// Errors returned when creating outbound queues.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueConfigError {
    #[error("invalid rate {0}; must be between 1 and {max}", max = MAX_OUTBOUND_RATE)]
    InvalidRate(usize),
    #[error("invalid capacity {0}; must be >= 1")]
    InvalidCapacity(usize),
}

struct HandleInner {
    tx: mpsc::Sender<Datagram>,
    limiter: Option<RateLimiter>,
}

/// Cloneable producer side of the outbound queue.
#[derive(Clone)]
pub struct OutboundHandle(Arc<HandleInner>);

impl std::fmt::Debug for OutboundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundHandle")
            .field("paced", &self.0.limiter.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for OutboundHandle {
    /// Reserves queue capacity before waiting on the rate limiter, so a
    /// closed queue fails fast instead of waiting for tokens.
    async fn send(
        &self,
        to: &PeerPointer,
        frame: Bytes,
        mode: SendMode,
    ) -> Result<(), TransportError> {
        let permit = match mode {
            SendMode::Wait => self
                .0
                .tx
                .clone()
                .reserve_owned()
                .await
                .map_err(|_| TransportError::Closed)?,
            SendMode::NoWait => self
                .0
                .tx
                .clone()
                .try_reserve_owned()
                .map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => TransportError::Full,
                    mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
                })?,
        };

        if let Some(limiter) = &self.0.limiter {
            limiter.acquire(1).await;
        }

        let len = frame.len();
        let returned = permit.send(Datagram {
            to: to.clone(),
            frame,
        });
        if returned.is_closed() {
            return Err(TransportError::Closed);
        }
        debug!("frame queued: to={}, len={len}", to.id);
        Ok(())
    }
}

/// Receiver end of the outbound queue.
#[derive(Debug)]
pub struct OutboundQueues {
    rx: mpsc::Receiver<Datagram>,
}

impl OutboundQueues {
    /// Start building a new outbound queue.
    #[must_use]
    pub fn builder() -> OutboundQueuesBuilder { OutboundQueuesBuilder::default() }

    /// Receive the next queued frame.
    ///
    /// Returns `None` once every handle is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Datagram> { self.rx.recv().await }

    /// Stop accepting frames; queued frames can still be received.
    pub fn close(&mut self) { self.rx.close(); }

    /// Forward queued frames to `sink` until the queue closes.
    ///
    /// Delivery failures are logged and the frame is dropped; the network is
    /// unreliable anyway and acknowledgments drive any retry.
    pub async fn pump(mut self, sink: Arc<dyn Transport>) {
        while let Some(Datagram { to, frame }) = self.recv().await {
            if let Err(err) = sink.send(&to, frame, SendMode::Wait).await {
                debug!("frame dropped by transport: to={}, error={err}", to.id);
                crate::metrics::inc_dropped("transport");
            }
        }
    }
}

/// Builder for [`OutboundQueues`].
///
/// # Examples
///
/// ```
/// use hyperroute::transport::OutboundQueues;
///
/// let (_queues, _handle) = OutboundQueues::builder()
///     .capacity(16)
///     .rate(Some(500))
///     .build()
///     .expect("valid queue configuration");
/// ```
#[derive(Debug)]
pub struct OutboundQueuesBuilder {
    capacity: usize,
    rate: Option<usize>,
}

impl Default for OutboundQueuesBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            rate: None,
        }
    }
}

impl OutboundQueuesBuilder {
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the pacing rate in frames per second; `None` disables pacing.
    #[must_use]
    pub fn rate(mut self, rate: Option<usize>) -> Self {
        self.rate = rate;
        self
    }

    /// Build the queue and its producer handle.
    ///
    /// # Errors
    ///
    /// Returns [`QueueConfigError::InvalidRate`] if the rate is zero or above
    /// [`MAX_OUTBOUND_RATE`] and [`QueueConfigError::InvalidCapacity`] if the
    /// capacity is zero.
    pub fn build(self) -> Result<(OutboundQueues, OutboundHandle), QueueConfigError> {
        if let Some(rate) = self.rate
            && (rate == 0 || rate > MAX_OUTBOUND_RATE)
        {
            return Err(QueueConfigError::InvalidRate(rate));
        }
        if self.capacity == 0 {
            return Err(QueueConfigError::InvalidCapacity(self.capacity));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let limiter = self.rate.map(|rate| {
            RateLimiter::builder()
                .initial(rate)
                .refill(rate)
                .interval(Duration::from_secs(1))
                .max(rate)
                .build()
        });
        Ok((
            OutboundQueues { rx },
            OutboundHandle(Arc::new(HandleInner { tx, limiter })),
        ))
    }
}
