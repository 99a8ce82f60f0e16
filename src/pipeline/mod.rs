//! Type-dispatched processing before every send and after every receive.
//!
//! A [`Pipeline`] is an ordered list of [`Processor`]s. Each processor
//! declares the message types it accepts; the pipeline runs the accepting
//! ones in order and stops the moment one returns [`Flow::Stop`], fails or
//! panics. A failure only ever aborts the chain of the message being
//! processed.
//!
//! Processors are chosen by name in [`PipelineConfig`](crate::config::PipelineConfig)
//! and resolved once at startup through [`ProcessorKind`].

use std::{panic::AssertUnwindSafe, str::FromStr};

use async_trait::async_trait;
use derive_more::Display;
use futures::FutureExt;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    ack::{AckManager, DeliveryCallback},
    config::OverlayConfig,
    id::PeerPointer,
    message::{Message, MessageType},
    routing::{RoutingManager, RoutingParams, SendInfo},
    transport::TransportError,
};

mod dedup;
mod handlers;
mod rate_limit;
mod route_back;

pub use dedup::{DedupKey, DuplicateFilter};
pub use handlers::{AckTracking, DataAckHandler, DataHandler, Forwarder};
pub use rate_limit::RateLimitFilter;
pub use route_back::RouteBackGate;


/// Whether the chain goes on after a processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Drop the message; later processors do not run.
    Stop,
}

/// What the node does with a received message once the chain completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the message to the local application.
    Deliver,
    /// Route the message one hop further towards its recipient.
    Forward,
    /// Relay a route-back message one hop further along its registered route.
    RelayBack,
    /// A processor has fully handled the message.
    Consumed,
}

/// A message travelling through a pipeline.
pub struct Envelope {
    pub message: Message,
    /// Peer the message arrived from; `None` on the send side.
    pub direct_sender: Option<PeerPointer>,
    /// Explicit first hop that bypasses next-hop selection (send side).
    pub direct_recipient: Option<PeerPointer>,
    pub disposition: Disposition,
    /// Per-call routing overrides (send side).
    pub params: Option<RoutingParams>,
    /// Delivery callback awaiting an acknowledgment tracker (send side).
    pub callback: Option<DeliveryCallback>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("direct_sender", &self.direct_sender)
            .field("direct_recipient", &self.direct_recipient)
            .field("disposition", &self.disposition)
            .field("params", &self.params)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Envelope {
    /// Envelope for a locally originated message.
    #[must_use]
    pub fn outbound(
        message: Message,
        params: Option<RoutingParams>,
        callback: Option<DeliveryCallback>,
    ) -> Self {
        Self {
            message,
            direct_sender: None,
            direct_recipient: None,
            disposition: Disposition::Forward,
            params,
            callback,
        }
    }

    /// Envelope for a message received from `direct_sender`.
    #[must_use]
    pub fn inbound(message: Message, direct_sender: PeerPointer, disposition: Disposition) -> Self {
        Self {
            message,
            direct_sender: Some(direct_sender),
            direct_recipient: None,
            disposition,
            params: None,
            callback: None,
        }
    }

    /// Pin the first hop of an outbound message to `peer`.
    #[must_use]
    pub fn with_direct_recipient(mut self, peer: Option<PeerPointer>) -> Self {
        self.direct_recipient = peer;
        self
    }

    /// Routing request for the message in its current state.
    #[must_use]
    pub fn send_info(&self) -> SendInfo {
        SendInfo {
            message: self.message.clone(),
            direct_sender: self.direct_sender.clone(),
            direct_recipient: self.direct_recipient.clone(),
            params: self.params,
            unicast: true,
        }
    }
}

/// Failures reported by a processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The transport refused a message the processor sent.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The processor could not handle the message.
    #[error("{processor} failed: {reason}")]
    Failed {
        processor: &'static str,
        reason: String,
    },
}

/// Components shared by every processor.
#[derive(Debug)]
pub struct Core {
    routing: RoutingManager,
    acks: AckManager,
}

impl Core {
    #[must_use]
    pub fn new(routing: RoutingManager, acks: AckManager) -> Self { Self { routing, acks } }

    #[must_use]
    pub fn local(&self) -> &PeerPointer { self.routing.local() }

    #[must_use]
    pub fn routing(&self) -> &RoutingManager { &self.routing }

    #[must_use]
    pub fn acks(&self) -> &AckManager { &self.acks }

    /// Whether `message` ends its journey at this node.
    #[must_use]
    pub fn is_final_recipient(&self, message: &Message) -> bool {
        message.recipient == self.local().id
            || self.routing.selector().is_responsible(&message.recipient)
    }

    /// Route `info`, waiting for transport capacity.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport has shut down.
    pub async fn route(&self, info: SendInfo) -> Result<bool, TransportError> {
        self.routing.route_message(info, true).await
    }
}

/// One step of a pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this processor handles messages of `kind`.
    fn accepts(&self, kind: MessageType) -> bool;

    /// Handle `envelope`, possibly rewriting it.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] when the message cannot be handled; the
    /// chain stops for this message.
    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError>;

    /// Forget state older than the processor's retention window.
    fn purge_expired_at(&self, _now: Instant) {}
}

/// Built-in processors, by configuration name.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    RouteBack,
    Dedup,
    RateLimit,
    AckTracking,
    Data,
    DataAck,
    Forward,
}

/// Error returned when a processor name is not recognised.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown processor: {0}")]
pub struct UnknownProcessor(String);

impl FromStr for ProcessorKind {
    type Err = UnknownProcessor;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "RouteBack" => Ok(Self::RouteBack),
            "Dedup" => Ok(Self::Dedup),
            "RateLimit" => Ok(Self::RateLimit),
            "AckTracking" => Ok(Self::AckTracking),
            "Data" => Ok(Self::Data),
            "DataAck" => Ok(Self::DataAck),
            "Forward" => Ok(Self::Forward),
            other => Err(UnknownProcessor(other.to_owned())),
        }
    }
}

impl ProcessorKind {
    /// Construct the processor from `config`.
    #[must_use]
    pub fn build(self, config: &OverlayConfig) -> Box<dyn Processor> {
        match self {
            Self::RouteBack => Box::new(RouteBackGate::new(
                config.pipeline.process_route_back_messages_by_nodes_on_route,
            )),
            Self::Dedup => Box::new(DuplicateFilter::new(&config.duplicates)),
            Self::RateLimit => Box::new(RateLimitFilter::new(&config.rate_limit)),
            Self::AckTracking => Box::new(AckTracking),
            Self::Data => Box::new(DataHandler),
            Self::DataAck => Box::new(DataAckHandler),
            Self::Forward => Box::new(Forwarder),
        }
    }
}

/// An ordered chain of processors.
#[derive(Default)]
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|p| p.name()))
            .finish()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self { Self { processors } }

    /// Build the chain for `kinds`, in order.
    #[must_use]
    pub fn from_kinds(kinds: &[ProcessorKind], config: &OverlayConfig) -> Self {
        Self::new(kinds.iter().map(|kind| kind.build(config)).collect())
    }

    /// Append `processor` to the chain.
    pub fn push(&mut self, processor: Box<dyn Processor>) { self.processors.push(processor); }

    #[must_use]
    pub fn len(&self) -> usize { self.processors.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.processors.is_empty() }

    /// Run the accepting processors over `envelope`.
    ///
    /// Processor failures and panics are logged and stop the chain.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when a processor found the
    /// transport shut down.
    pub async fn run(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, TransportError> {
        let kind = envelope.message.kind;
        for processor in self.processors.iter().filter(|p| p.accepts(kind)) {
            let serial = envelope.message.serial;
            let name = processor.name();
            let outcome = AssertUnwindSafe(processor.process(core, envelope))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Stop)) => {
                    debug!("chain stopped: serial={serial}, processor={name}");
                    return Ok(Flow::Stop);
                }
                Ok(Err(ProcessorError::Transport(TransportError::Closed))) => {
                    return Err(TransportError::Closed);
                }
                Ok(Err(err)) => {
                    warn!("processor failed: serial={serial}, processor={name}, error={err}");
                    crate::metrics::inc_dropped("processor_failed");
                    return Ok(Flow::Stop);
                }
                Err(panic) => {
                    let panic_msg = crate::panic::format_panic(panic);
                    // Emit via both `log` and `tracing` for tests that capture either.
                    error!("processor panicked: serial={serial}, processor={name}, panic={panic_msg}");
                    tracing::error!(serial, processor = name, panic = %panic_msg, "processor panicked");
                    crate::metrics::inc_dropped("processor_panicked");
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Let every processor forget expired state.
    pub fn purge_expired_at(&self, now: Instant) {
        for processor in &self.processors {
            processor.purge_expired_at(now);
        }
    }
}
