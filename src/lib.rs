#![doc(html_root_url = "https://docs.rs/hyperroute/latest")]
//! Public API for the `hyperroute` library.
//!
//! This crate provides the message transport core of a structured overlay
//! node: next-hop routing with traffic-analysis resistance, registered
//! (callable-back) routes, acknowledgment-driven retry, fragmentation and
//! reassembly, and the send/receive processing pipelines that tie them
//! together with duplicate suppression and rate limiting.

pub mod ack;
pub mod byte_order;
pub mod codec;
pub mod config;
pub mod crc;
pub mod error;
pub mod fragment;
pub mod id;
pub mod message;
pub mod metrics;
pub mod node;
pub mod outbound;
pub mod panic;
pub mod pipeline;
pub mod routing;
pub mod scheduler;
pub mod transport;
pub mod window;

#[cfg(test)]
mod test_helpers;

pub use ack::{AckManager, DeliveryOutcome, DeliveryReport};
pub use config::OverlayConfig;
pub use error::{OverlayError, Result};
pub use fragment::{Fragmenter, Reassembler};
pub use id::{NodeId, PeerPointer};
pub use message::{Message, MessageType};
pub use node::{Node, SendRequest};
pub use pipeline::{Pipeline, Processor, ProcessorKind};
pub use routing::{NextHopSelector, RoutingManager, SendInfo};
pub use transport::{Transport, TransportError};
