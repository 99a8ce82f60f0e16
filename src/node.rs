//! A complete overlay node.
//!
//! [`Node`] wires the routing manager, the acknowledgment manager, the
//! fragmenter and both pipelines to a host transport. Sending assigns a
//! serial number, runs the send pipeline and routes the message. Receiving
//! decodes and reassembles a frame, runs the receive pipeline and hands
//! messages addressed to this node to the application inbox.
//!
//! Background work runs on the node's [`TaskTracker`]: the outbound queue
//! pump, the delivery callback dispatcher, one worker per inbound category,
//! and the maintenance sweep started by [`Node::spawn_maintenance`].

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    ack::{AckManager, DeliveryCallback, callback_queue},
    codec::WireCodec,
    config::OverlayConfig,
    error::{OverlayError, Result},
    fragment::{Fragmenter, Reassembler},
    id::{NodeId, PeerPointer},
    message::{DEFAULT_TTL, Message, MessageType, SerialCounter},
    outbound::Outbound,
    pipeline::{Core, Disposition, Envelope, Flow, Pipeline},
    routing::{NextHopSelector, RoutingManager, RoutingParams},
    scheduler::Periodic,
    transport::{OutboundQueues, Transport},
};

/// A message the application wants to send.
#[must_use]
pub struct SendRequest {
    pub recipient: NodeId,
    pub kind: MessageType,
    pub payload: Bytes,
    pub ttl: u16,
    pub params: Option<RoutingParams>,
    pub callback: Option<DeliveryCallback>,
    /// First hop to hand the message to, bypassing next-hop selection.
    pub direct_recipient: Option<PeerPointer>,
    /// Await transport capacity instead of dropping when it is full.
    pub wait: bool,
}

impl std::fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRequest")
            .field("recipient", &self.recipient)
            .field("kind", &self.kind)
            .field("payload", &self.payload.len())
            .field("ttl", &self.ttl)
            .field("params", &self.params)
            .field("direct_recipient", &self.direct_recipient)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl SendRequest {
    /// A DATA message for `recipient`.
    pub fn data(recipient: NodeId, payload: impl Into<Bytes>) -> Self {
        Self {
            recipient,
            kind: MessageType::Data,
            payload: payload.into(),
            ttl: DEFAULT_TTL,
            params: None,
            callback: None,
            direct_recipient: None,
            wait: true,
        }
    }

    /// A DATA reply travelling back along the route `received` registered.
    ///
    /// The reply is handed straight to the peer that last relayed `received`
    /// and retraces the registered route from there.
    pub fn reply_along(received: &Message, payload: impl Into<Bytes>) -> Self {
        let params = RoutingParams {
            route_back: true,
            anonymous_route: received.is_anonymous_route(),
            route_id: Some(received.route_id),
            ..RoutingParams::default()
        };
        Self::data(received.sender, payload)
            .params(params)
            .direct_recipient(PeerPointer::new(
                received.sender,
                received.sender_address.clone(),
            ))
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn ttl(mut self, ttl: u16) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn params(mut self, params: RoutingParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Run `callback` once the delivery outcome is known.
    pub fn on_delivery(mut self, callback: DeliveryCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Hand the message to `peer` instead of selecting a next hop.
    pub fn direct_recipient(mut self, peer: PeerPointer) -> Self {
        self.direct_recipient = Some(peer);
        self
    }

    /// Drop the message instead of waiting when the transport is full.
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }
}

/// Worker categories for inbound frames; order is kept within a category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    Data,
    Control,
}

impl Category {
    const fn of(kind: MessageType) -> Self {
        match kind {
            MessageType::Data | MessageType::DataAck => Self::Data,
            _ => Self::Control,
        }
    }
}

type Inbound = (Message, PeerPointer);

struct Shared {
    core: Core,
    send: Pipeline,
    receive: Pipeline,
    reassembler: Reassembler,
    codec: WireCodec,
    inbox: mpsc::UnboundedSender<Message>,
}

impl Shared {
    async fn accept(&self, message: Message, from: PeerPointer) -> Result<()> {
        let message = match self.reassembler.reassembly_message(message) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!("fragment dropped: from={}, reason={err}", from.id);
                crate::metrics::inc_dropped("reassembly");
                return Ok(());
            }
        };
        let disposition = if self.core.is_final_recipient(&message) {
            Disposition::Deliver
        } else {
            Disposition::Forward
        };
        let mut envelope = Envelope::inbound(message, from, disposition);
        if self.receive.run(&self.core, &mut envelope).await? == Flow::Stop {
            return Ok(());
        }
        match envelope.disposition {
            Disposition::Deliver => {
                if self.inbox.send(envelope.message).is_err() {
                    debug!("message dropped: reason=inbox closed");
                }
            }
            Disposition::Forward | Disposition::RelayBack => {
                warn!(
                    "message dropped: serial={}, reason=no forwarding processor",
                    envelope.message.serial
                );
                crate::metrics::inc_dropped("not_forwarded");
            }
            Disposition::Consumed => {}
        }
        Ok(())
    }

    async fn maintain_at(&self, now: Instant) -> Result<usize> {
        let resends = self.core.acks().process_awaiting_acks_at(now);
        let count = resends.len();
        for info in resends {
            self.core.routing().route_message(info, true).await?;
        }
        self.reassembler.purge_expired_at(now);
        self.core.routing().purge_expired_routes_at(now);
        self.send.purge_expired_at(now);
        self.receive.purge_expired_at(now);
        Ok(count)
    }
}

/// An overlay node bound to a host transport.
pub struct Node {
    shared: Arc<Shared>,
    serials: Arc<SerialCounter>,
    workers: [mpsc::Sender<Inbound>; 2],
    tracker: TaskTracker,
    token: CancellationToken,
    maintenance: Periodic,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", self.local())
            .field("send", &self.shared.send)
            .field("receive", &self.shared.receive)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Build a node and start its background tasks.
    ///
    /// Returns the node and the inbox receiving messages delivered to it.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Config`] when `config` fails validation and
    /// [`OverlayError::Queue`] when the outbound queue cannot be built.
    pub fn new(
        local: PeerPointer,
        config: &OverlayConfig,
        selector: Arc<dyn NextHopSelector>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>)> {
        config.validate()?;
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        let (queues, handle) = OutboundQueues::builder()
            .capacity(config.transport.outbound_capacity)
            .rate(config.transport.outbound_rate)
            .build()?;
        let pump_token = token.clone();
        tracker.spawn(async move {
            tokio::select! {
                biased;
                () = pump_token.cancelled() => {}
                () = queues.pump(transport) => {}
            }
        });

        let (callbacks, dispatcher) = callback_queue();
        let dispatch_token = token.clone();
        tracker.spawn(async move {
            tokio::select! {
                biased;
                () = dispatch_token.cancelled() => {}
                () = dispatcher.run() => {}
            }
        });

        let codec = WireCodec::new(config.byte_order);
        let outbound = Outbound::new(
            Fragmenter::new(config.fragments.fragment_length, codec),
            codec,
            Arc::new(handle),
        );
        let serials = Arc::new(SerialCounter::starting_at(1));
        let routing = RoutingManager::new(
            local.clone(),
            config.routing.clone(),
            config.anonymity.clone(),
            selector,
            outbound,
        );
        let acks = AckManager::new(
            local,
            config.acks.clone(),
            config.byte_order,
            Arc::clone(&serials),
            callbacks,
        );
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            core: Core::new(routing, acks),
            send: Pipeline::from_kinds(&config.pipeline.send_kinds()?, config),
            receive: Pipeline::from_kinds(&config.pipeline.receive_kinds()?, config),
            reassembler: Reassembler::new(
                config.fragments.fragments_retention_period,
                config.fragments.prevent_fragment_duplicates,
                config.byte_order,
            ),
            codec,
            inbox,
        });

        let workers = [Category::Data, Category::Control].map(|category| {
            spawn_worker(
                category,
                Arc::clone(&shared),
                config.transport.inbound_capacity,
                &tracker,
                token.clone(),
            )
        });

        let maintenance = Periodic::new("maintenance", config.schedule_interval, token.child_token());
        let node = Self {
            shared,
            serials,
            workers,
            tracker,
            token,
            maintenance,
        };
        Ok((node, inbox_rx))
    }

    /// Pointer of the local node.
    #[must_use]
    pub fn local(&self) -> &PeerPointer { self.shared.core.local() }

    /// Routing manager, acknowledgment manager and local identity.
    #[must_use]
    pub fn core(&self) -> &Core { &self.shared.core }

    /// Send a message, returning its serial number.
    ///
    /// A message dropped by the send pipeline or by routing is not an error:
    /// its serial is still returned and, when it is tracked, its callback
    /// eventually reports it undelivered.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::ShutDown`] after [`Node::shutdown`] and
    /// [`OverlayError::Transport`] when the transport has closed.
    pub async fn send(&self, request: SendRequest) -> Result<u32> {
        if self.token.is_cancelled() {
            return Err(OverlayError::ShutDown);
        }
        let SendRequest {
            recipient,
            kind,
            payload,
            ttl,
            params,
            callback,
            direct_recipient,
            wait,
        } = request;
        let serial = self.serials.allocate();
        let message = Message::builder(kind, self.local(), recipient)
            .serial(serial)
            .ttl(ttl)
            .payload(payload)
            .build();
        let shared = &self.shared;
        let mut envelope =
            Envelope::outbound(message, params, callback).with_direct_recipient(direct_recipient);
        if shared.send.run(&shared.core, &mut envelope).await? == Flow::Stop {
            return Ok(serial);
        }
        shared
            .core
            .routing()
            .route_message(envelope.send_info(), wait)
            .await?;
        Ok(serial)
    }

    /// Handle a frame received from `from` on the calling task.
    ///
    /// Malformed frames and dropped messages are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Transport`] when the transport has closed
    /// while the message was being processed.
    pub async fn receive(&self, frame: Bytes, from: PeerPointer) -> Result<()> {
        let Some(message) = self.decode(frame, &from) else {
            return Ok(());
        };
        self.shared.accept(message, from).await
    }

    /// Queue a frame received from `from` for the worker of its category.
    ///
    /// Frames of one category are processed in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::ShutDown`] once the workers have stopped.
    pub async fn enqueue(&self, frame: Bytes, from: PeerPointer) -> Result<()> {
        let Some(message) = self.decode(frame, &from) else {
            return Ok(());
        };
        let worker = match Category::of(message.kind) {
            Category::Data => &self.workers[0],
            Category::Control => &self.workers[1],
        };
        worker
            .send((message, from))
            .await
            .map_err(|_| OverlayError::ShutDown)
    }

    /// Run one maintenance sweep at `now`, returning the number of resends.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Transport`] when the transport has closed.
    pub async fn run_maintenance_at(&self, now: Instant) -> Result<usize> {
        self.shared.maintain_at(now).await
    }

    /// Start the periodic maintenance sweep.
    ///
    /// Returns `false` when it is already running or the node is shut down.
    pub fn spawn_maintenance(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        self.maintenance.spawn(&self.tracker, move || {
            let shared = Arc::clone(&shared);
            async move {
                if let Err(err) = shared.maintain_at(Instant::now()).await {
                    warn!("maintenance sweep aborted: error={err}");
                }
            }
        })
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.maintenance.stop();
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn decode(&self, frame: Bytes, from: &PeerPointer) -> Option<Message> {
        match self.shared.codec.decode(frame) {
            Ok(message) => Some(message),
            Err(err) => {
                debug!("frame dropped: from={}, reason={err}", from.id);
                crate::metrics::inc_dropped("malformed_frame");
                None
            }
        }
    }
}

fn spawn_worker(
    category: Category,
    shared: Arc<Shared>,
    capacity: usize,
    tracker: &TaskTracker,
    token: CancellationToken,
) -> mpsc::Sender<Inbound> {
    let (tx, mut rx) = mpsc::channel::<Inbound>(capacity);
    tracker.spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some((message, from)) = next else { break };
            if let Err(err) = shared.accept(message, from).await {
                warn!("inbound worker stopped: category={category:?}, error={err}");
                break;
            }
        }
    });
    tx
}
