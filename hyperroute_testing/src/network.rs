//! An in-process network connecting overlay nodes.
//!
//! Every frame a node transmits is captured before delivery, so tests can
//! inspect traffic or replay a frame from a different direct sender. Links
//! can be blocked per direction to simulate loss.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use hyperroute::{
    DeliveryReport,
    Message,
    NextHopSelector,
    Node,
    NodeId,
    OverlayConfig,
    PeerPointer,
    Transport,
    TransportError,
    id::NetworkAddress,
    ack::DeliveryCallback,
    byte_order::ByteOrder,
    codec::WireCodec,
    transport::SendMode,
};
use tokio::sync::{mpsc, oneshot};

use crate::selector::RingSelector;

type Mailbox = mpsc::UnboundedSender<(Bytes, PeerPointer)>;

/// A frame observed on the network.
#[derive(Clone, Debug)]
pub struct Captured {
    pub from: PeerPointer,
    pub to: PeerPointer,
    pub frame: Bytes,
}

impl Captured {
    /// Decode the frame, or `None` when it is malformed.
    #[must_use]
    pub fn decode(&self, byte_order: ByteOrder) -> Option<Message> {
        WireCodec::new(byte_order).decode(self.frame.clone()).ok()
    }
}

#[derive(Default)]
struct State {
    mailboxes: HashMap<NetworkAddress, Mailbox>,
    captured: Vec<Captured>,
    blocked: HashSet<(NetworkAddress, NetworkAddress)>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct Network {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Network")
            .field("nodes", &state.mailboxes.len())
            .field("captured", &state.captured.len())
            .finish()
    }
}

impl Network {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Pointers `1..=n` with addresses `node-1`, `node-2`, ...
    #[must_use]
    pub fn ring_of(n: u64) -> Vec<PeerPointer> {
        (1..=n)
            .map(|i| PeerPointer::new(NodeId::from_u64(i), format!("node-{i}")))
            .collect()
    }

    /// Transport transmitting on behalf of `local`.
    #[must_use]
    pub fn transport(&self, local: PeerPointer) -> Arc<NetworkTransport> {
        Arc::new(NetworkTransport {
            local,
            network: self.clone(),
        })
    }

    /// Start a node at `local` and feed it every frame addressed to it.
    ///
    /// # Errors
    ///
    /// Returns the node's construction error, typically a rejected config.
    pub fn spawn(
        &self,
        local: PeerPointer,
        config: &OverlayConfig,
        selector: Arc<dyn NextHopSelector>,
    ) -> hyperroute::Result<TestNode> {
        let (node, inbox) = Node::new(local.clone(), config, selector, self.transport(local.clone()))?;
        let node = Arc::new(node);
        let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, PeerPointer)>();
        self.state().mailboxes.insert(local.address.clone(), tx);

        let receiver = Arc::clone(&node);
        tokio::spawn(async move {
            while let Some((frame, from)) = rx.recv().await {
                if receiver.receive(frame, from).await.is_err() {
                    break;
                }
            }
        });
        Ok(TestNode { node, inbox })
    }

    /// Start one node per member of `ring`, each routing to its successor.
    ///
    /// # Panics
    ///
    /// Panics if `config` is rejected.
    #[must_use]
    pub fn spawn_ring(&self, ring: &[PeerPointer], config: &OverlayConfig) -> Vec<TestNode> {
        (0..ring.len())
            .map(|position| {
                let selector = Arc::new(RingSelector::new(ring.to_vec(), position));
                self.spawn(ring[position].clone(), config, selector)
                    .expect("ring node should start")
            })
            .collect()
    }

    /// Every frame transmitted so far, in order.
    #[must_use]
    pub fn captured(&self) -> Vec<Captured> { self.state().captured.clone() }

    /// Frames transmitted from `from` to `to`.
    #[must_use]
    pub fn captured_between(&self, from: &PeerPointer, to: &PeerPointer) -> Vec<Bytes> {
        self.state()
            .captured
            .iter()
            .filter(|c| c.from == *from && c.to == *to)
            .map(|c| c.frame.clone())
            .collect()
    }

    /// Silently drop frames travelling from `from` to `to`.
    pub fn block(&self, from: &PeerPointer, to: &PeerPointer) {
        self.state()
            .blocked
            .insert((from.address.clone(), to.address.clone()));
    }

    /// Restore the link from `from` to `to`.
    pub fn unblock(&self, from: &PeerPointer, to: &PeerPointer) {
        self.state()
            .blocked
            .remove(&(from.address.clone(), to.address.clone()));
    }

    /// Deliver `frame` to `to` as though `from` had sent it.
    ///
    /// Returns `false` when no node listens at `to`.
    pub fn inject(&self, to: &PeerPointer, from: PeerPointer, frame: Bytes) -> bool {
        self.state()
            .mailboxes
            .get(&to.address)
            .is_some_and(|mailbox| mailbox.send((frame, from)).is_ok())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`Transport`] handing frames to the [`Network`].
#[derive(Debug)]
pub struct NetworkTransport {
    local: PeerPointer,
    network: Network,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn send(
        &self,
        to: &PeerPointer,
        frame: Bytes,
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state();
        state.captured.push(Captured {
            from: self.local.clone(),
            to: to.clone(),
            frame: frame.clone(),
        });
        if state
            .blocked
            .contains(&(self.local.address.clone(), to.address.clone()))
        {
            return Ok(());
        }
        let mailbox = state
            .mailboxes
            .get(&to.address)
            .ok_or_else(|| TransportError::Unreachable(to.address.to_string()))?;
        mailbox
            .send((frame, self.local.clone()))
            .map_err(|_| TransportError::Unreachable(to.address.to_string()))
    }
}

/// A running node together with its application inbox.
#[derive(Debug)]
pub struct TestNode {
    pub node: Arc<Node>,
    pub inbox: mpsc::UnboundedReceiver<Message>,
}

impl TestNode {
    #[must_use]
    pub fn peer(&self) -> &PeerPointer { self.node.local() }

    /// Next delivered message, waiting at most `within`.
    pub async fn delivered_within(&mut self, within: Duration) -> Option<Message> {
        tokio::time::timeout(within, self.inbox.recv()).await.ok().flatten()
    }

    /// Every message delivered so far, without waiting.
    pub fn drain_inbox(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.inbox.try_recv() {
            messages.push(message);
        }
        messages
    }
}

impl std::ops::Deref for TestNode {
    type Target = Node;

    fn deref(&self) -> &Self::Target { &self.node }
}

/// A delivery callback and the receiver its report arrives on.
#[must_use]
pub fn delivery_report() -> (DeliveryCallback, oneshot::Receiver<DeliveryReport>) {
    let (tx, rx) = oneshot::channel();
    let callback: DeliveryCallback = Box::new(move |report: DeliveryReport| {
        let _ = tx.send(report);
    });
    (callback, rx)
}
