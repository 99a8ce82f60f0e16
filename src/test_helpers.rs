//! Test-only collaborators shared by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    ack::{AckManager, CallbackDispatcher, callback_queue},
    codec::WireCodec,
    config::OverlayConfig,
    fragment::Fragmenter,
    id::{NodeId, PeerPointer},
    message::{Message, SerialCounter},
    outbound::Outbound,
    pipeline::Core,
    routing::{NextHopSelector, RoutingManager, SelectionParams},
    transport::{SendMode, Transport, TransportError},
};

/// Selector answering from fixed tables.
#[derive(Debug, Default)]
pub struct ScriptedSelector {
    pub responsible: HashSet<NodeId>,
    pub next_hops: HashMap<NodeId, PeerPointer>,
    pub candidates: Vec<PeerPointer>,
    pub closer_fraction: f64,
    /// Switch secure routing on in the parameters of every selection.
    pub force_secure_routing: bool,
}

impl ScriptedSelector {
    #[must_use]
    pub fn with_next_hop(mut self, target: NodeId, hop: PeerPointer) -> Self {
        self.next_hops.insert(target, hop);
        self
    }
}

impl NextHopSelector for ScriptedSelector {
    fn is_responsible(&self, target: &NodeId) -> bool { self.responsible.contains(target) }

    fn find_next_hop(&self, target: &NodeId, params: &mut SelectionParams) -> Option<PeerPointer> {
        if self.force_secure_routing {
            params.secure_routing = true;
        }
        self.next_hops.get(target).cloned()
    }

    fn find_next_hops(
        &self,
        _target: &NodeId,
        _params: &mut SelectionParams,
        count: usize,
    ) -> Vec<PeerPointer> {
        self.candidates.iter().take(count).cloned().collect()
    }

    fn closer_neighbor_fraction(&self, _target: &NodeId) -> f64 { self.closer_fraction }
}

/// Transport recording every frame handed to it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<(PeerPointer, Bytes)>>,
    closed: bool,
}

impl RecordingTransport {
    /// A transport that rejects every frame as closed.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            frames: Mutex::default(),
            closed: true,
        }
    }

    /// Frames sent so far, decoded with the default codec.
    #[must_use]
    pub fn messages(&self) -> Vec<(PeerPointer, Message)> {
        let codec = WireCodec::default();
        self.frames
            .lock()
            .expect("recording lock")
            .iter()
            .map(|(to, frame)| (to.clone(), codec.decode(frame.clone()).expect("decodable")))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        to: &PeerPointer,
        frame: Bytes,
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.frames
            .lock()
            .expect("recording lock")
            .push((to.clone(), frame));
        Ok(())
    }
}

/// Outbound path writing straight into `transport` with default framing.
#[must_use]
pub fn outbound_to(transport: Arc<dyn Transport>) -> Outbound {
    let codec = WireCodec::default();
    Outbound::new(Fragmenter::new(1400, codec), codec, transport)
}

/// Pointer of the test node numbered `n`.
#[must_use]
pub fn peer(n: u64) -> PeerPointer { PeerPointer::new(NodeId::from_u64(n), format!("10.0.0.{n}:4000")) }

/// A [`Core`] for node `n` whose transport records every frame.
pub struct TestCore {
    pub core: Core,
    pub transport: Arc<RecordingTransport>,
    pub callbacks: CallbackDispatcher,
}

impl TestCore {
    #[must_use]
    pub fn new(n: u64, selector: ScriptedSelector, config: &OverlayConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let (queue, callbacks) = callback_queue();
        let routing = RoutingManager::new(
            peer(n),
            config.routing.clone(),
            config.anonymity.clone(),
            Arc::new(selector),
            outbound_to(transport.clone()),
        );
        let acks = AckManager::new(
            peer(n),
            config.acks.clone(),
            config.byte_order,
            Arc::new(SerialCounter::starting_at(1)),
            queue,
        );
        Self {
            core: Core::new(routing, acks),
            transport,
            callbacks,
        }
    }

    /// Messages handed to the transport so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(PeerPointer, Message)> { self.transport.messages() }
}
