//! Test collaborators for driving [`hyperroute`] nodes in memory.
//!
//! [`network::Network`] connects any number of nodes through an in-process
//! transport that can capture, replay and drop frames; [`selector`] offers
//! next-hop selectors with predictable paths; [`logging`] serialises access
//! to a captured logger.
//!
//! ```rust
//! use hyperroute::OverlayConfig;
//! use hyperroute_testing::network::Network;
//!
//! # async fn example() {
//! let network = Network::new();
//! let ring = Network::ring_of(3);
//! let nodes = network.spawn_ring(&ring, &OverlayConfig::default());
//! assert_eq!(nodes.len(), 3);
//! # }
//! ```

pub mod logging;
pub mod network;
pub mod selector;

pub use logging::{LoggerHandle, logger};
pub use network::{Captured, Network, NetworkTransport, TestNode, delivery_report};
pub use selector::{RingSelector, StaticSelector};
