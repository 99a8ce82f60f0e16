//! Identifier and addressing primitives for overlay peers.
//!
//! [`NodeId`] names a position in the identifier space, [`NetworkAddress`]
//! is the opaque transport-level locator, and [`PeerPointer`] pairs the two
//! so routing decisions can carry both around by value.

use std::fmt;

use bytes::Bytes;
use derive_more::{From, Into};

/// Width in bytes of every identifier in the overlay.
pub const NODE_ID_LEN: usize = 20;

/// Fixed-width identifier of a node or of a routing target.
///
/// # Examples
///
/// ```
/// use hyperroute::id::NodeId;
/// let id = NodeId::from_u64(7);
/// assert_eq!(id.as_bytes()[19], 7);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, From, Into)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Identifier made of zero bytes.
    pub const ZERO: NodeId = NodeId([0; NODE_ID_LEN]);

    /// Wrap raw identifier bytes.
    #[must_use]
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self { Self(bytes) }

    /// Build an identifier whose low-order bytes hold `value` in big-endian order.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0_u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Borrow the identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] { &self.0 }

    /// Copy an identifier out of a slice of exactly [`NODE_ID_LEN`] bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; NODE_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// 32-bit FNV-1a fold of the identifier.
    ///
    /// Duplicate suppression and fragment reassembly key messages by this
    /// value rather than by the full identifier.
    #[must_use]
    pub fn sender_hash(&self) -> u32 {
        const OFFSET: u32 = 0x811c_9dc5;
        const PRIME: u32 = 0x0100_0193;
        self.0
            .iter()
            .fold(OFFSET, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(PRIME))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "NodeId({self})") }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Transport-defined locator of a peer, carried verbatim on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, From, Into)]
pub struct NetworkAddress(Bytes);

impl NetworkAddress {
    /// Wrap transport address bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self { Self(bytes.into()) }

    /// Borrow the address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    /// Length of the encoded address.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the address carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<&'static str> for NetworkAddress {
    fn from(value: &'static str) -> Self { Self(Bytes::from_static(value.as_bytes())) }
}

impl From<String> for NetworkAddress {
    fn from(value: String) -> Self { Self(Bytes::from(value)) }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Identifier and address of a concrete peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerPointer {
    pub id: NodeId,
    pub address: NetworkAddress,
}

impl PeerPointer {
    #[must_use]
    pub fn new(id: NodeId, address: impl Into<NetworkAddress>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}
