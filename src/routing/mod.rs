//! Next-hop decisions and the anonymity transforms applied on the way.
//!
//! [`RoutingManager::route`] is the synchronous decision: it updates the hop
//! count and ttl, merges routing parameters on a message's first hop,
//! resolves the next hop (through the [`NextHopSelector`] or a registered
//! route), registers routes and rewrites sender identities. The async
//! [`RoutingManager::route_message`] additionally hands the result to the
//! transport.
//!
//! Dropping is a normal outcome: a [`RouteDrop`] explains why and
//! `route_message` reports it as `Ok(false)`. Only a closed transport is an
//! error, because it means the node is shutting down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;

use crate::{
    config::{AnonymityConfig, RoutingConfig},
    id::PeerPointer,
    message::{HOP_COUNT_CONCEALED, Message, MessageFlags},
    outbound::{Outbound, OutboundError},
    transport::{SendMode, TransportError},
};

pub mod anonymity;
mod params;
mod registered;
mod selector;

pub use params::{RouteDecision, RouteDrop, RoutingParams, SelectionParams, SendInfo};
pub use registered::{ROUTE_ID_DRAWS, RegisteredRoute, RegisteredRouteTable, RouteRequest};
pub use selector::NextHopSelector;

#[cfg(test)]
mod tests;

/// Routes messages one hop at a time.
pub struct RoutingManager {
    local: PeerPointer,
    routing: RoutingConfig,
    anonymity: AnonymityConfig,
    selector: Arc<dyn NextHopSelector>,
    routes: RegisteredRouteTable,
    rng: Mutex<StdRng>,
    outbound: Outbound,
}

impl std::fmt::Debug for RoutingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingManager")
            .field("local", &self.local)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl RoutingManager {
    #[must_use]
    pub fn new(
        local: PeerPointer,
        routing: RoutingConfig,
        anonymity: AnonymityConfig,
        selector: Arc<dyn NextHopSelector>,
        outbound: Outbound,
    ) -> Self {
        let rng = routing
            .rng_seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            routes: RegisteredRouteTable::new(routing.registered_routes_retention_time),
            local,
            routing,
            anonymity,
            selector,
            rng: Mutex::new(rng),
            outbound,
        }
    }

    /// Pointer of the local node.
    #[must_use]
    pub fn local(&self) -> &PeerPointer { &self.local }

    /// The next-hop selector this manager consults.
    #[must_use]
    pub fn selector(&self) -> &Arc<dyn NextHopSelector> { &self.selector }

    /// Table of routes registered at this node.
    #[must_use]
    pub fn routes(&self) -> &RegisteredRouteTable { &self.routes }

    /// Look up a live registered route by its outbound id.
    #[must_use]
    pub fn get_registered_route(&self, route_id: u32) -> Option<RegisteredRoute> {
        self.get_registered_route_at(route_id, Instant::now())
    }

    #[must_use]
    pub fn get_registered_route_at(&self, route_id: u32, now: Instant) -> Option<RegisteredRoute> {
        self.routes.get_at(route_id, now)
    }

    /// Decide how to route `info` and transmit the result.
    ///
    /// Returns `Ok(false)` when the message was dropped. With `wait` set the
    /// call awaits transport capacity; otherwise a full transport drops the
    /// message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the transport has shut down.
    pub async fn route_message(&self, info: SendInfo, wait: bool) -> Result<bool, TransportError> {
        let serial = info.message.serial;
        let decision = match self.route(info) {
            Ok(decision) => decision,
            Err(drop) => {
                log_drop(serial, &drop);
                crate::metrics::inc_dropped(drop.reason());
                return Ok(false);
            }
        };
        match self
            .outbound
            .send(&decision.next_hop, &decision.message, SendMode::from_wait(wait))
            .await
        {
            Ok(_) => {
                crate::metrics::inc_routed();
                Ok(true)
            }
            Err(OutboundError::Transport(TransportError::Closed)) => Err(TransportError::Closed),
            Err(err) => {
                debug!("message dropped: serial={serial}, reason={err}");
                crate::metrics::inc_dropped("outbound");
                Ok(false)
            }
        }
    }

    /// Make the routing decision for `info` using the current time.
    ///
    /// # Errors
    ///
    /// Returns the [`RouteDrop`] explaining why the message must be dropped.
    pub fn route(&self, info: SendInfo) -> Result<RouteDecision, RouteDrop> {
        self.route_at(info, Instant::now())
    }

    /// Make the routing decision for `info` at `now`.
    ///
    /// # Errors
    ///
    /// Returns the [`RouteDrop`] explaining why the message must be dropped.
    pub fn route_at(&self, info: SendInfo, now: Instant) -> Result<RouteDecision, RouteDrop> {
        let SendInfo {
            mut message,
            direct_sender,
            direct_recipient,
            params,
            unicast,
        } = info;

        if message.ttl == 0 {
            return Err(RouteDrop::TtlExhausted);
        }

        anonymity::increment_hop_count(&mut message);
        let first_hop = message.hop_count == 1;
        let mut rng = self.rng();

        if first_hop {
            self.apply_defaults(&mut message, params.as_ref());
        }
        self.check_policy(&message)?;
        if first_hop
            && unicast
            && direct_recipient.is_none()
            && !message.is_route_back()
            && self.requires_transform(&message)
        {
            self.apply_distance_transform(&mut message)?;
        }

        anonymity::update_ttl(&self.anonymity, &mut message, &mut *rng);

        let next_hop = if message.is_route_back() {
            match direct_recipient {
                Some(peer) if first_hop => peer,
                _ => self.resolve_route_back(&mut message, direct_sender.as_ref(), now)?,
            }
        } else if let Some(peer) = direct_recipient {
            peer
        } else {
            self.resolve_next_hop(&mut message)?
        };

        if message.is_register_route() && !message.is_route_back() && next_hop != self.local {
            let request = RouteRequest {
                inbound: direct_sender.clone().unwrap_or_else(|| self.local.clone()),
                inbound_route_id: message.route_id,
                outbound: next_hop.clone(),
                origin: direct_sender.is_none(),
                remote_id: message.recipient,
            };
            let route_id = self.routes.register_at(request, &mut *rng, now)?;
            debug!(
                "route registered: serial={}, route_id={route_id}, next_hop={}",
                message.serial, next_hop.id
            );
            message.route_id = route_id;
            self.rewrite_sender(&mut message);
        }

        if message.is_anonymous_route() {
            self.rewrite_sender(&mut message);
        }

        if first_hop && anonymity::conceals_hop_count(&self.anonymity, &message) {
            message.hop_count = HOP_COUNT_CONCEALED;
        }

        Ok(RouteDecision { message, next_hop })
    }

    /// Remove expired registered routes.
    pub fn purge_expired_routes_at(&self, now: Instant) -> usize {
        let purged = self.routes.purge_expired_at(now);
        if purged > 0 {
            debug!("registered routes purged: count={purged}");
        }
        purged
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_defaults(&self, message: &mut Message, params: Option<&RoutingParams>) {
        let defaults = [
            (self.anonymity.secure_routing, MessageFlags::SECURE_ROUTING),
            (
                self.anonymity.skip_random_next_hops,
                MessageFlags::SKIP_RANDOM_NEXT_HOPS,
            ),
            (
                self.anonymity.prefix_mismatch_heuristic,
                MessageFlags::PREFIX_MISMATCH_HEURISTIC,
            ),
        ];
        for (enabled, flag) in defaults {
            if enabled {
                message.flags.insert(flag);
            }
        }
        if let Some(params) = params {
            params.apply_to(message);
        }
    }

    fn check_policy(&self, message: &Message) -> Result<(), RouteDrop> {
        let registered = message.is_register_route() || message.is_route_back();
        if registered && !self.routing.allow_registered_routes {
            return Err(RouteDrop::RegisteredRoutesDisallowed);
        }
        if message.is_anonymous_route() && !self.routing.allow_anonymous_routes {
            return Err(RouteDrop::AnonymousRoutesDisallowed);
        }
        Ok(())
    }

    fn requires_transform(&self, message: &Message) -> bool {
        self.anonymity.ensure_steinhaus_point_anonymity
            && (self.anonymity.anonymity_required || message.is_anonymous_route())
    }

    /// Re-point the distance-transform origin at the second-best candidate
    /// when enough of the neighbourhood lies closer to the target than we do.
    fn apply_distance_transform(&self, message: &mut Message) -> Result<(), RouteDrop> {
        let target = message.recipient;
        let fraction = self.selector.closer_neighbor_fraction(&target);
        if fraction < self.anonymity.steinhaus_point_anonymity_distance_factor {
            return Ok(());
        }
        let mut params = SelectionParams::of(message);
        let candidates = self.selector.find_next_hops(&target, &mut params, 2);
        let [_, second, ..] = candidates.as_slice() else {
            return Err(RouteDrop::TransformCandidatesMissing);
        };
        params.transform_origin = Some(second.id);
        params.prefix_mismatch_heuristic = true;
        params.store(message);
        Ok(())
    }

    fn resolve_next_hop(&self, message: &mut Message) -> Result<PeerPointer, RouteDrop> {
        let target = message.recipient;
        if target == self.local.id || self.selector.is_responsible(&target) {
            return Ok(self.local.clone());
        }
        let mut params = SelectionParams::of(message);
        let next_hop = self
            .selector
            .find_next_hop(&target, &mut params)
            .ok_or(RouteDrop::NoNextHop { target })?;
        params.store(message);
        Ok(next_hop)
    }

    /// Step a route-back message one hop towards the route's origin.
    fn resolve_route_back(
        &self,
        message: &mut Message,
        direct_sender: Option<&PeerPointer>,
        now: Instant,
    ) -> Result<PeerPointer, RouteDrop> {
        let route_id = message.route_id;
        let route = self
            .routes
            .get_at(route_id, now)
            .ok_or(RouteDrop::UnknownRoute { route_id })?;
        if let Some(sender) = direct_sender
            && *sender != route.outbound
        {
            return Err(RouteDrop::RouteSenderMismatch {
                route_id,
                sender: sender.id,
            });
        }
        message.route_id = route.inbound_route_id;
        message.recipient = route.inbound.id;
        message.transform_origin = None;
        self.rewrite_sender(message);
        Ok(route.inbound)
    }

    fn rewrite_sender(&self, message: &mut Message) {
        message.sender = self.local.id;
        message.sender_address = self.local.address.clone();
    }
}

fn log_drop(serial: u32, drop: &RouteDrop) {
    match drop {
        RouteDrop::UnknownRoute { .. } | RouteDrop::RouteSenderMismatch { .. } => {
            warn!("message dropped: serial={serial}, reason={drop}");
        }
        _ => debug!("message dropped: serial={serial}, reason={drop}"),
    }
}
