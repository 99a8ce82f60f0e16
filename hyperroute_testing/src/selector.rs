//! Next-hop selectors with predictable paths.

use hyperroute::{
    NextHopSelector,
    NodeId,
    PeerPointer,
    routing::SelectionParams,
};

/// Routes every message to the local node's successor on a fixed ring.
///
/// A node is responsible only for its own identifier, so a message sent
/// around a ring of `n` nodes visits every node between sender and
/// recipient in ring order.
#[derive(Clone, Debug)]
pub struct RingSelector {
    ring: Vec<PeerPointer>,
    position: usize,
}

impl RingSelector {
    /// Selector for the member at `position` of `ring`.
    ///
    /// # Panics
    ///
    /// Panics if `position` is outside `ring`.
    #[must_use]
    pub fn new(ring: Vec<PeerPointer>, position: usize) -> Self {
        assert!(position < ring.len(), "position outside ring");
        Self { ring, position }
    }

    fn local(&self) -> &PeerPointer { &self.ring[self.position] }

    fn successors(&self) -> impl Iterator<Item = &PeerPointer> {
        let len = self.ring.len();
        (1..len).map(move |step| &self.ring[(self.position + step) % len])
    }

    /// Forward ring distance from member `from` to `target`, if it is a member.
    fn distance(&self, from: usize, target: &NodeId) -> Option<usize> {
        let len = self.ring.len();
        let at = self.ring.iter().position(|peer| peer.id == *target)?;
        Some((at + len - from) % len)
    }
}

impl NextHopSelector for RingSelector {
    fn is_responsible(&self, target: &NodeId) -> bool { self.local().id == *target }

    fn find_next_hop(&self, target: &NodeId, _params: &mut SelectionParams) -> Option<PeerPointer> {
        if self.is_responsible(target) {
            return None;
        }
        self.successors().next().cloned()
    }

    fn find_next_hops(
        &self,
        target: &NodeId,
        _params: &mut SelectionParams,
        count: usize,
    ) -> Vec<PeerPointer> {
        if self.is_responsible(target) {
            return Vec::new();
        }
        self.successors().take(count).cloned().collect()
    }

    fn closer_neighbor_fraction(&self, target: &NodeId) -> f64 {
        let Some(own) = self.distance(self.position, target) else {
            return 0.0;
        };
        let len = self.ring.len();
        if len < 2 {
            return 0.0;
        }
        let closer = (0..len)
            .filter(|&at| at != self.position)
            .filter_map(|at| self.distance(at, target))
            .filter(|&distance| distance < own)
            .count();
        let as_f64 = |n: usize| f64::from(u32::try_from(n).unwrap_or(u32::MAX));
        as_f64(closer) / as_f64(len - 1)
    }
}

/// Responsible for nothing; always hands messages to one fixed neighbour.
#[derive(Clone, Debug)]
pub struct StaticSelector {
    next_hop: Option<PeerPointer>,
}

impl StaticSelector {
    #[must_use]
    pub fn new(next_hop: PeerPointer) -> Self {
        Self {
            next_hop: Some(next_hop),
        }
    }

    /// A selector that never finds a next hop.
    #[must_use]
    pub fn dead_end() -> Self { Self { next_hop: None } }
}

impl NextHopSelector for StaticSelector {
    fn is_responsible(&self, _target: &NodeId) -> bool { false }

    fn find_next_hop(&self, _target: &NodeId, _params: &mut SelectionParams) -> Option<PeerPointer> {
        self.next_hop.clone()
    }

    fn find_next_hops(
        &self,
        _target: &NodeId,
        _params: &mut SelectionParams,
        count: usize,
    ) -> Vec<PeerPointer> {
        self.next_hop.iter().take(count).cloned().collect()
    }

    fn closer_neighbor_fraction(&self, _target: &NodeId) -> f64 {
        if self.next_hop.is_some() { 1.0 } else { 0.0 }
    }
}
