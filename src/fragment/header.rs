//! Fragmentation metadata stored in header extension slot 0.

use bytes::{Bytes, BytesMut};

use crate::byte_order::ByteOrder;

/// Encoded size of a [`FragmentExtension`]: a 2-byte index and a 2-byte total.
pub const FRAGMENT_EXTENSION_LEN: usize = 4;

/// Position of one fragment within its logical message.
///
/// # Examples
///
/// ```
/// use hyperroute::{byte_order::ByteOrder, fragment::FragmentExtension};
///
/// let ext = FragmentExtension::new(2, 5);
/// let blob = ext.encode(ByteOrder::Big);
/// assert_eq!(&blob[..], &[0, 2, 0, 5]);
/// assert_eq!(FragmentExtension::decode(ByteOrder::Big, &blob), Some(ext));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentExtension {
    index: u16,
    total: u16,
}

impl FragmentExtension {
    #[must_use]
    pub const fn new(index: u16, total: u16) -> Self { Self { index, total } }

    /// Zero-based position of the fragment.
    #[must_use]
    pub const fn index(&self) -> u16 { self.index }

    /// Number of fragments forming the message.
    #[must_use]
    pub const fn total(&self) -> u16 { self.total }

    /// Encode the extension blob.
    #[must_use]
    pub fn encode(&self, order: ByteOrder) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_EXTENSION_LEN);
        order.put_u16(&mut buf, self.index);
        order.put_u16(&mut buf, self.total);
        buf.freeze()
    }

    /// Decode an extension blob, returning `None` unless it is exactly
    /// [`FRAGMENT_EXTENSION_LEN`] bytes long.
    #[must_use]
    pub fn decode(order: ByteOrder, mut blob: &[u8]) -> Option<Self> {
        if blob.len() != FRAGMENT_EXTENSION_LEN {
            return None;
        }
        let index = order.get_u16(&mut blob)?;
        let total = order.get_u16(&mut blob)?;
        Some(Self { index, total })
    }
}
