//! Next-hop selection, supplied by the host.
//!
//! The identifier-space metric and the routing table live outside this
//! crate. The routing manager only asks the selector who is responsible for a
//! target and which neighbours bring a message closer to it.

use crate::id::{NodeId, PeerPointer};

use super::SelectionParams;

/// Chooses next hops in the identifier space.
///
/// Implementations may adjust `params` (for example switching to secure
/// routing when the routing table is sparse); the routing manager persists
/// the adjusted flags onto the message.
pub trait NextHopSelector: Send + Sync {
    /// Whether the local node owns `target`.
    fn is_responsible(&self, target: &NodeId) -> bool;

    /// Best next hop towards `target`, or `None` when no neighbour is closer.
    fn find_next_hop(&self, target: &NodeId, params: &mut SelectionParams) -> Option<PeerPointer>;

    /// Up to `count` next-hop candidates towards `target`, best first.
    fn find_next_hops(
        &self,
        target: &NodeId,
        params: &mut SelectionParams,
        count: usize,
    ) -> Vec<PeerPointer>;

    /// Fraction of the local neighbourhood set closer to `target` than the
    /// local node, in `[0, 1]`.
    fn closer_neighbor_fraction(&self, target: &NodeId) -> f64;
}
