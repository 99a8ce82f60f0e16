//! Values exchanged with the routing manager.

use thiserror::Error;

use crate::{
    id::{NodeId, PeerPointer},
    message::{Message, MessageFlags},
};

/// Per-call routing overrides supplied by the sender.
///
/// Overrides only ever switch a flag on; they never clear a flag already set
/// by configuration or by the message itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingParams {
    pub secure_routing: bool,
    pub skip_random_next_hops: bool,
    pub register_route: bool,
    pub route_back: bool,
    pub anonymous_route: bool,
    /// Route id to stamp on the message, for replies along a registered route.
    pub route_id: Option<u32>,
}

impl RoutingParams {
    /// Set the flags requested here on `message`.
    pub fn apply_to(&self, message: &mut Message) {
        let flags = &mut message.flags;
        for (requested, flag) in [
            (self.secure_routing, MessageFlags::SECURE_ROUTING),
            (self.skip_random_next_hops, MessageFlags::SKIP_RANDOM_NEXT_HOPS),
            (self.register_route, MessageFlags::REGISTER_ROUTE),
            (self.route_back, MessageFlags::ROUTE_BACK),
            (self.anonymous_route, MessageFlags::ANONYMOUS_ROUTE),
        ] {
            if requested {
                flags.insert(flag);
            }
        }
        if let Some(route_id) = self.route_id {
            message.route_id = route_id;
        }
    }
}

/// Selection modes seen and possibly adjusted by a
/// [`NextHopSelector`](super::NextHopSelector).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionParams {
    pub secure_routing: bool,
    pub skip_random_next_hops: bool,
    pub prefix_mismatch_heuristic: bool,
    pub transform_origin: Option<NodeId>,
}

impl SelectionParams {
    /// Read the selection modes carried by `message`.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        Self {
            secure_routing: message.flags.contains(MessageFlags::SECURE_ROUTING),
            skip_random_next_hops: message.flags.contains(MessageFlags::SKIP_RANDOM_NEXT_HOPS),
            prefix_mismatch_heuristic: message
                .flags
                .contains(MessageFlags::PREFIX_MISMATCH_HEURISTIC),
            transform_origin: message.transform_origin,
        }
    }

    /// Persist the selection modes onto `message`.
    pub fn store(&self, message: &mut Message) {
        let flags = &mut message.flags;
        flags.set(MessageFlags::SECURE_ROUTING, self.secure_routing);
        flags.set(MessageFlags::SKIP_RANDOM_NEXT_HOPS, self.skip_random_next_hops);
        flags.set(
            MessageFlags::PREFIX_MISMATCH_HEURISTIC,
            self.prefix_mismatch_heuristic,
        );
        message.transform_origin = self.transform_origin;
    }
}

/// Everything the routing manager needs to route one message.
#[derive(Clone, Debug)]
pub struct SendInfo {
    pub message: Message,
    /// Peer the message arrived from; `None` for locally originated messages.
    pub direct_sender: Option<PeerPointer>,
    /// Explicit next hop, bypassing next-hop selection.
    pub direct_recipient: Option<PeerPointer>,
    pub params: Option<RoutingParams>,
    /// The message travels towards a single destination identifier.
    pub unicast: bool,
}

impl SendInfo {
    /// Route a locally originated message towards its recipient.
    #[must_use]
    pub fn local(message: Message) -> Self {
        Self {
            message,
            direct_sender: None,
            direct_recipient: None,
            params: None,
            unicast: true,
        }
    }

    /// Route a message received from `direct_sender` one hop further.
    #[must_use]
    pub fn forward(message: Message, direct_sender: PeerPointer) -> Self {
        Self {
            message,
            direct_sender: Some(direct_sender),
            direct_recipient: None,
            params: None,
            unicast: true,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: RoutingParams) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_direct_recipient(mut self, direct_recipient: PeerPointer) -> Self {
        self.direct_recipient = Some(direct_recipient);
        self
    }
}

/// Outcome of a successful routing decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    /// The message as it must be transmitted.
    pub message: Message,
    pub next_hop: PeerPointer,
}

/// Why a message was dropped instead of routed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteDrop {
    #[error("ttl exhausted")]
    TtlExhausted,
    #[error("registered routes are disabled")]
    RegisteredRoutesDisallowed,
    #[error("anonymous routes are disabled")]
    AnonymousRoutesDisallowed,
    #[error("no next hop towards {target}")]
    NoNextHop { target: NodeId },
    #[error("fewer than two candidates for the distance transform")]
    TransformCandidatesMissing,
    #[error("no registered route {route_id}")]
    UnknownRoute { route_id: u32 },
    #[error("route {route_id} used by unexpected peer {sender}")]
    RouteSenderMismatch { route_id: u32, sender: NodeId },
    #[error("no free route id after {attempts} draws")]
    RouteIdsExhausted { attempts: u32 },
}

impl RouteDrop {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::TtlExhausted => "ttl_exhausted",
            Self::RegisteredRoutesDisallowed => "registered_routes_disallowed",
            Self::AnonymousRoutesDisallowed => "anonymous_routes_disallowed",
            Self::NoNextHop { .. } => "no_next_hop",
            Self::TransformCandidatesMissing => "transform_candidates_missing",
            Self::UnknownRoute { .. } => "unknown_route",
            Self::RouteSenderMismatch { .. } => "route_sender_mismatch",
            Self::RouteIdsExhausted { .. } => "route_ids_exhausted",
        }
    }
}
