//! Registered routes: reversible hop-by-hop paths.
//!
//! Each hop forwarding a message that requests route registration records
//! where the message came from and where it went, under a freshly drawn route
//! id. Replies travelling back (route-back messages) retrace the path by
//! looking the id up at every hop.

use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use rand::Rng;
use tokio::time::Instant;

use super::RouteDrop;
use crate::id::{NodeId, PeerPointer};

/// Draws attempted before giving up on finding a free route id.
pub const ROUTE_ID_DRAWS: u32 = 64;

/// One hop of a registered route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredRoute {
    /// Peer the registering message came from; the local node at the origin.
    pub inbound: PeerPointer,
    /// Route id the message carried when it arrived.
    pub inbound_route_id: u32,
    /// Peer the registering message was sent to.
    pub outbound: PeerPointer,
    /// Route id minted at this hop, the key of the entry.
    pub outbound_route_id: u32,
    /// Whether the route starts at this node.
    pub origin: bool,
    /// Recipient of the registering message.
    pub remote_id: NodeId,
    pub created_at: Instant,
}

/// Data describing a route about to be registered; the table mints the id.
#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub inbound: PeerPointer,
    pub inbound_route_id: u32,
    pub outbound: PeerPointer,
    pub origin: bool,
    pub remote_id: NodeId,
}

/// Concurrent table of registered routes keyed by outbound route id.
#[derive(Debug)]
pub struct RegisteredRouteTable {
    routes: DashMap<u32, RegisteredRoute>,
    retention: Duration,
}

impl RegisteredRouteTable {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            retention,
        }
    }

    fn is_expired(&self, route: &RegisteredRoute, now: Instant) -> bool {
        now.saturating_duration_since(route.created_at) >= self.retention
    }

    /// Record `request` under a random unused route id.
    ///
    /// Id 0 means "no route" and is never drawn. The id is reserved through
    /// the map entry, so concurrent registrations cannot collide.
    ///
    /// # Errors
    ///
    /// Returns [`RouteDrop::RouteIdsExhausted`] when every draw hits a live
    /// route.
    pub fn register_at(
        &self,
        request: RouteRequest,
        rng: &mut impl Rng,
        now: Instant,
    ) -> Result<u32, RouteDrop> {
        for _ in 0..ROUTE_ID_DRAWS {
            let id: u32 = rng.r#gen();
            if id == 0 {
                continue;
            }
            let route = RegisteredRoute {
                inbound: request.inbound.clone(),
                inbound_route_id: request.inbound_route_id,
                outbound: request.outbound.clone(),
                outbound_route_id: id,
                origin: request.origin,
                remote_id: request.remote_id,
                created_at: now,
            };
            match self.routes.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(route);
                    return Ok(id);
                }
                Entry::Occupied(mut slot) if self.is_expired(slot.get(), now) => {
                    slot.insert(route);
                    return Ok(id);
                }
                Entry::Occupied(_) => {}
            }
        }
        Err(RouteDrop::RouteIdsExhausted {
            attempts: ROUTE_ID_DRAWS,
        })
    }

    /// Look up a live route, removing it if it has expired.
    #[must_use]
    pub fn get_at(&self, route_id: u32, now: Instant) -> Option<RegisteredRoute> {
        let guard = self.routes.get(&route_id);
        let route = guard
            .as_deref()
            .filter(|route| !self.is_expired(route, now))
            .cloned();
        let stale = guard.is_some() && route.is_none();
        drop(guard);
        if stale {
            self.routes
                .remove_if(&route_id, |_, route| self.is_expired(route, now));
        }
        route
    }

    /// Remove every expired route, returning how many were removed.
    ///
    /// `DashMap::retain` acquires per-shard write locks, so lookups may
    /// contend briefly while the table is pruned.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| !self.is_expired(route, now));
        before.saturating_sub(self.routes.len())
    }

    #[must_use]
    pub fn len(&self) -> usize { self.routes.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.routes.is_empty() }
}
