//! Binary framing for [`Message`] headers.
//!
//! Layout, with integers in the configured [`ByteOrder`]:
//!
//! ```text
//! version u16 | serial u32 | type u8 | ttl u16 | hop_count u16 | route_id u32
//! flags u8 | sender [20] | recipient [20] | address_len u16 | address
//! [transform_origin [20] when the distance-transform flag is set]
//! crc u32 | extension_count u8 | { slot u8 | len u16 | bytes }*
//! payload (remainder of the frame)
//! ```
//!
//! Decoding never panics on malformed input; every failure is a
//! [`FrameError`] which callers log and drop.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::{
    byte_order::ByteOrder,
    id::{NODE_ID_LEN, NetworkAddress, NodeId},
    message::{Extensions, Message, MessageFlags, MessageType, PROTOCOL_VERSION},
};

/// Bytes occupied by the fixed part of the header, excluding the variable
/// address, optional transform origin and extension table.
pub const FIXED_HEADER_LEN: usize = 2 + 4 + 1 + 2 + 2 + 4 + 1 + 2 * NODE_ID_LEN + 2 + 4 + 1;

const_assert_eq!(FIXED_HEADER_LEN, 63);

/// Encoded overhead of one extension entry besides its blob.
pub const EXTENSION_ENTRY_OVERHEAD: usize = 1 + 2;

const RESERVED_FLAG_BITS: u8 = 0x80;

/// Failures raised while encoding or decoding frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame ended before `field` could be read.
    #[error("frame truncated while reading {field}")]
    Truncated { field: &'static str },
    /// The frame announces a protocol version this node does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    /// Bits reserved for future use were set.
    #[error("reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),
    /// Two extension entries used the same slot.
    #[error("duplicate extension slot {0}")]
    DuplicateExtension(u8),
    /// The sender address does not fit its 16-bit length prefix.
    #[error("sender address of {0} bytes exceeds the length prefix")]
    AddressTooLong(usize),
    /// An extension blob does not fit its 16-bit length prefix.
    #[error("extension slot {slot} holds {len} bytes, exceeding the length prefix")]
    ExtensionTooLong { slot: u8, len: usize },
    /// More extensions than the 8-bit count can describe.
    #[error("{0} extensions exceed the extension table limit")]
    TooManyExtensions(usize),
    /// The payload does not match the header checksum.
    #[error("checksum mismatch: header 0x{expected:08x}, payload 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Encoder and decoder for the overlay wire header.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireCodec {
    byte_order: ByteOrder,
}

impl WireCodec {
    /// Create a codec writing integers in `byte_order`.
    #[must_use]
    pub const fn new(byte_order: ByteOrder) -> Self { Self { byte_order } }

    /// Byte order used by this codec.
    #[must_use]
    pub const fn byte_order(&self) -> ByteOrder { self.byte_order }

    /// Encoded length of everything but the payload.
    #[must_use]
    pub fn header_len(&self, message: &Message) -> usize {
        let origin = if message.transform_origin.is_some() {
            NODE_ID_LEN
        } else {
            0
        };
        let extensions: usize = message
            .extensions
            .values()
            .map(|blob| EXTENSION_ENTRY_OVERHEAD + blob.len())
            .sum();
        FIXED_HEADER_LEN + message.sender_address.len() + origin + extensions
    }

    /// Total encoded length of `message`.
    #[must_use]
    pub fn encoded_len(&self, message: &Message) -> usize {
        self.header_len(message) + message.payload.len()
    }

    /// Encode `message` into a single frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when a variable-length field does not fit its
    /// length prefix.
    pub fn encode(&self, message: &Message) -> Result<Bytes, FrameError> {
        let order = self.byte_order;
        let address_len = u16::try_from(message.sender_address.len())
            .map_err(|_| FrameError::AddressTooLong(message.sender_address.len()))?;
        let extension_count = u8::try_from(message.extensions.len())
            .map_err(|_| FrameError::TooManyExtensions(message.extensions.len()))?;

        let mut buf = BytesMut::with_capacity(self.encoded_len(message));
        order.put_u16(&mut buf, message.version);
        order.put_u32(&mut buf, message.serial);
        buf.put_u8(message.kind.code());
        order.put_u16(&mut buf, message.ttl);
        order.put_u16(&mut buf, message.hop_count);
        order.put_u32(&mut buf, message.route_id);

        let mut flags = message.flags;
        flags.set(
            MessageFlags::DISTANCE_TRANSFORM,
            message.transform_origin.is_some(),
        );
        buf.put_u8(flags.bits());
        buf.put_slice(message.sender.as_bytes());
        buf.put_slice(message.recipient.as_bytes());
        order.put_u16(&mut buf, address_len);
        buf.put_slice(message.sender_address.as_bytes());
        if let Some(origin) = &message.transform_origin {
            buf.put_slice(origin.as_bytes());
        }
        order.put_u32(&mut buf, message.crc);

        buf.put_u8(extension_count);
        for (slot, blob) in &message.extensions {
            let len = u16::try_from(blob.len()).map_err(|_| FrameError::ExtensionTooLong {
                slot: *slot,
                len: blob.len(),
            })?;
            buf.put_u8(*slot);
            order.put_u16(&mut buf, len);
            buf.put_slice(blob);
        }

        buf.put_slice(&message.payload);
        Ok(buf.freeze())
    }

    /// Decode a frame.
    ///
    /// Unfragmented frames have their checksum verified here; fragments are
    /// verified once reassembled.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for truncated or malformed frames, unknown
    /// versions and checksum mismatches.
    pub fn decode(&self, mut frame: Bytes) -> Result<Message, FrameError> {
        let order = self.byte_order;

        let version = order
            .get_u16(&mut frame)
            .ok_or(FrameError::Truncated { field: "version" })?;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let serial = order
            .get_u32(&mut frame)
            .ok_or(FrameError::Truncated { field: "serial" })?;
        let kind = MessageType::from_code(take_u8(&mut frame, "type")?);
        let ttl = order
            .get_u16(&mut frame)
            .ok_or(FrameError::Truncated { field: "ttl" })?;
        let hop_count = order
            .get_u16(&mut frame)
            .ok_or(FrameError::Truncated { field: "hop_count" })?;
        let route_id = order
            .get_u32(&mut frame)
            .ok_or(FrameError::Truncated { field: "route_id" })?;

        let bits = take_u8(&mut frame, "flags")?;
        if bits & RESERVED_FLAG_BITS != 0 {
            return Err(FrameError::ReservedFlags(bits));
        }
        let mut flags = MessageFlags::from_bits(bits);
        let has_origin = flags.contains(MessageFlags::DISTANCE_TRANSFORM);
        flags.set(MessageFlags::DISTANCE_TRANSFORM, false);

        let sender = take_id(&mut frame, "sender")?;
        let recipient = take_id(&mut frame, "recipient")?;
        let address_len = order
            .get_u16(&mut frame)
            .ok_or(FrameError::Truncated {
                field: "sender_address",
            })?;
        let sender_address = NetworkAddress::new(take_bytes(
            &mut frame,
            usize::from(address_len),
            "sender_address",
        )?);
        let transform_origin = if has_origin {
            Some(take_id(&mut frame, "transform_origin")?)
        } else {
            None
        };
        let crc = order
            .get_u32(&mut frame)
            .ok_or(FrameError::Truncated { field: "crc" })?;

        let extension_count = take_u8(&mut frame, "extension_count")?;
        let mut extensions = Extensions::new();
        for _ in 0..extension_count {
            let slot = take_u8(&mut frame, "extension_slot")?;
            let len = order
                .get_u16(&mut frame)
                .ok_or(FrameError::Truncated {
                    field: "extension_length",
                })?;
            let blob = take_bytes(&mut frame, usize::from(len), "extension")?;
            if extensions.insert(slot, blob).is_some() {
                return Err(FrameError::DuplicateExtension(slot));
            }
        }

        let message = Message {
            version,
            serial,
            kind,
            ttl,
            hop_count,
            route_id,
            flags,
            sender,
            recipient,
            sender_address,
            transform_origin,
            crc,
            extensions,
            payload: frame,
        };

        if !message.is_fragment() && !message.checksum_matches() {
            return Err(FrameError::ChecksumMismatch {
                expected: message.crc,
                actual: crate::crc::crc32(&message.payload),
            });
        }
        Ok(message)
    }
}

fn take_u8(frame: &mut Bytes, field: &'static str) -> Result<u8, FrameError> {
    if frame.has_remaining() {
        Ok(frame.get_u8())
    } else {
        Err(FrameError::Truncated { field })
    }
}

fn take_bytes(frame: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes, FrameError> {
    if frame.remaining() < len {
        return Err(FrameError::Truncated { field });
    }
    Ok(frame.split_to(len))
}

fn take_id(frame: &mut Bytes, field: &'static str) -> Result<NodeId, FrameError> {
    let bytes = take_bytes(frame, NODE_ID_LEN, field)?;
    NodeId::from_slice(&bytes).ok_or(FrameError::Truncated { field })
}
