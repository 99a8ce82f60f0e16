//! Protocol message representation.
//!
//! [`Message`] is a plain value: every hop copies, rewrites and re-encodes
//! it. The header fields mirror the wire layout documented in
//! [`crate::codec`]; [`MessageBuilder`] stamps the payload checksum so a
//! freshly built message is always internally consistent.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};

use bytes::Bytes;
use serde::Deserialize;

use crate::{
    crc::crc32,
    id::{NetworkAddress, NodeId, PeerPointer},
};

/// Protocol version written into every header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Hop count value meaning "concealed".
pub const HOP_COUNT_CONCEALED: u16 = 0x7FFF;

/// Extension slot reserved for fragmentation metadata.
pub const FRAGMENT_SLOT: u8 = 0;

/// Default hop budget for new messages.
pub const DEFAULT_TTL: u16 = 64;

/// Message type codes understood by the pipeline.
///
/// Codes owned by protocols outside this crate (bootstrap, DHT) travel as
/// [`MessageType::Other`] and are dispatched like any other type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum MessageType {
    Data,
    DataAck,
    Join,
    JoinReply,
    Leave,
    LeaveReply,
    KeepAlive,
    Other(u8),
}

impl MessageType {
    /// Return the on-wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::DataAck => 2,
            Self::Join => 3,
            Self::JoinReply => 4,
            Self::Leave => 5,
            Self::LeaveReply => 6,
            Self::KeepAlive => 7,
            Self::Other(code) => code,
        }
    }

    /// Map an on-wire code to a type.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Data,
            2 => Self::DataAck,
            3 => Self::Join,
            4 => Self::JoinReply,
            5 => Self::Leave,
            6 => Self::LeaveReply,
            7 => Self::KeepAlive,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("DATA"),
            Self::DataAck => f.write_str("DATA_ACK"),
            Self::Join => f.write_str("JOIN"),
            Self::JoinReply => f.write_str("JOIN_REPLY"),
            Self::Leave => f.write_str("LEAVE"),
            Self::LeaveReply => f.write_str("LEAVE_REPLY"),
            Self::KeepAlive => f.write_str("KEEP_ALIVE"),
            Self::Other(code) => write!(f, "TYPE_{code}"),
        }
    }
}

/// Error returned when a message type name is not recognised.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageType(String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "DATA" => Ok(Self::Data),
            "DATA_ACK" => Ok(Self::DataAck),
            "JOIN" => Ok(Self::Join),
            "JOIN_REPLY" => Ok(Self::JoinReply),
            "LEAVE" => Ok(Self::Leave),
            "LEAVE_REPLY" => Ok(Self::LeaveReply),
            "KEEP_ALIVE" => Ok(Self::KeepAlive),
            other => other
                .strip_prefix("TYPE_")
                .and_then(|code| code.parse::<u8>().ok())
                .map(Self::from_code)
                .ok_or_else(|| UnknownMessageType(other.to_owned())),
        }
    }
}

impl TryFrom<String> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

/// Routing flags carried in the header bitfield.
///
/// The distance-transform bit is not stored here: it is derived from
/// [`Message::transform_origin`] when the header is encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const REGISTER_ROUTE: Self = Self(1 << 0);
    pub const ROUTE_BACK: Self = Self(1 << 1);
    pub const ANONYMOUS_ROUTE: Self = Self(1 << 2);
    pub const SECURE_ROUTING: Self = Self(1 << 3);
    pub const SKIP_RANDOM_NEXT_HOPS: Self = Self(1 << 4);
    pub const PREFIX_MISMATCH_HEURISTIC: Self = Self(1 << 5);
    /// Wire bit signalling a transform origin; see [`Message::transform_origin`].
    pub const DISTANCE_TRANSFORM: Self = Self(1 << 6);

    /// Flags with every bit cleared.
    #[must_use]
    pub const fn empty() -> Self { Self(0) }

    /// Rebuild flags from wire bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self { Self(bits) }

    /// Raw wire bits.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    /// Set or clear the bits of `other`.
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Set the bits of `other` without touching the rest.
    pub fn insert(&mut self, other: Self) { self.0 |= other.0; }
}

impl std::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output { Self(self.0 | rhs.0) }
}

/// Indexed header extension blobs.
pub type Extensions = BTreeMap<u8, Bytes>;

/// A protocol unit travelling through the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub version: u16,
    pub serial: u32,
    pub kind: MessageType,
    pub ttl: u16,
    pub hop_count: u16,
    /// Meaningful only with the register-route or route-back flag.
    pub route_id: u32,
    pub flags: MessageFlags,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub sender_address: NetworkAddress,
    /// Reference identifier for the next-hop metric; presence sets the
    /// distance-transform flag on the wire.
    pub transform_origin: Option<NodeId>,
    pub crc: u32,
    pub extensions: Extensions,
    pub payload: Bytes,
}

impl Message {
    /// Start building a message of `kind` from `sender` to `recipient`.
    #[must_use]
    pub fn builder(kind: MessageType, sender: &PeerPointer, recipient: NodeId) -> MessageBuilder {
        MessageBuilder::new(kind, sender, recipient)
    }

    #[must_use]
    pub const fn is_register_route(&self) -> bool {
        self.flags.contains(MessageFlags::REGISTER_ROUTE)
    }

    #[must_use]
    pub const fn is_route_back(&self) -> bool { self.flags.contains(MessageFlags::ROUTE_BACK) }

    #[must_use]
    pub const fn is_anonymous_route(&self) -> bool {
        self.flags.contains(MessageFlags::ANONYMOUS_ROUTE)
    }

    /// Anonymous routes without a registered return path cannot be acknowledged.
    #[must_use]
    pub const fn lacks_return_path(&self) -> bool {
        self.is_anonymous_route() && !self.is_register_route()
    }

    /// Whether the hop count has been replaced by the concealment sentinel.
    #[must_use]
    pub const fn is_hop_count_concealed(&self) -> bool { self.hop_count == HOP_COUNT_CONCEALED }

    /// Whether the fragmentation extension is present.
    #[must_use]
    pub fn is_fragment(&self) -> bool { self.extensions.contains_key(&FRAGMENT_SLOT) }

    /// Whether the stored checksum matches the payload.
    #[must_use]
    pub fn checksum_matches(&self) -> bool { crc32(&self.payload) == self.crc }

    /// Copy the header, replacing the payload.
    ///
    /// The checksum is left untouched: fragments carry the checksum of the
    /// logical payload they belong to.
    #[must_use]
    pub fn with_payload(&self, payload: Bytes) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }
}

/// Builder for locally originated messages.
///
/// # Examples
///
/// ```
/// use hyperroute::{
///     id::{NodeId, PeerPointer},
///     message::{Message, MessageType},
/// };
///
/// let me = PeerPointer::new(NodeId::from_u64(1), "10.0.0.1:4000");
/// let msg = Message::builder(MessageType::Data, &me, NodeId::from_u64(9))
///     .ttl(8)
///     .payload(&b"hello"[..])
///     .build();
/// assert_eq!(msg.ttl, 8);
/// assert!(msg.checksum_matches());
/// ```
#[derive(Debug)]
#[must_use]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    fn new(kind: MessageType, sender: &PeerPointer, recipient: NodeId) -> Self {
        Self {
            message: Message {
                version: PROTOCOL_VERSION,
                serial: 0,
                kind,
                ttl: DEFAULT_TTL,
                hop_count: 0,
                route_id: 0,
                flags: MessageFlags::empty(),
                sender: sender.id,
                recipient,
                sender_address: sender.address.clone(),
                transform_origin: None,
                crc: 0,
                extensions: Extensions::new(),
                payload: Bytes::new(),
            },
        }
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.message.serial = serial;
        self
    }

    pub fn ttl(mut self, ttl: u16) -> Self {
        self.message.ttl = ttl;
        self
    }

    pub fn route_id(mut self, route_id: u32) -> Self {
        self.message.route_id = route_id;
        self
    }

    pub fn flag(mut self, flag: MessageFlags, value: bool) -> Self {
        self.message.flags.set(flag, value);
        self
    }

    pub fn extension(mut self, slot: u8, blob: impl Into<Bytes>) -> Self {
        self.message.extensions.insert(slot, blob.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.message.payload = payload.into();
        self
    }

    /// Finish the message, stamping the payload checksum.
    #[must_use]
    pub fn build(mut self) -> Message {
        self.message.crc = crc32(&self.message.payload);
        self.message
    }
}

/// Source of serial numbers for locally originated messages.
///
/// Serials increase monotonically and wrap after `u32::MAX`.
#[derive(Debug, Default)]
pub struct SerialCounter(AtomicU32);

impl SerialCounter {
    /// Counter whose first serial is `first`.
    #[must_use]
    pub const fn starting_at(first: u32) -> Self { Self(AtomicU32::new(first)) }

    /// Take the next serial number.
    pub fn allocate(&self) -> u32 { self.0.fetch_add(1, Ordering::Relaxed) }
}
