//! Configurable byte-order conversions for the wire header.
//!
//! Peers of one overlay agree on a single [`ByteOrder`] through
//! configuration. These helpers keep the choice in one place so the codec can
//! stay explicit about wire endianness without branching at every field.

use bytes::{Buf, BufMut};
use serde::Deserialize;

/// Byte order used for every fixed-width integer on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum ByteOrder {
    /// Most significant byte first (network byte order).
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// Append `value` to `buf` in this byte order.
    ///
    /// # Examples
    ///
    /// ```
    /// use hyperroute::byte_order::ByteOrder;
    ///
    /// let mut buf = Vec::new();
    /// ByteOrder::Big.put_u16(&mut buf, 0x1234);
    /// ByteOrder::Little.put_u16(&mut buf, 0x1234);
    /// assert_eq!(buf, [0x12, 0x34, 0x34, 0x12]);
    /// ```
    pub fn put_u16(self, buf: &mut impl BufMut, value: u16) {
        match self {
            Self::Big => buf.put_u16(value),
            Self::Little => buf.put_u16_le(value),
        }
    }

    /// Append `value` to `buf` in this byte order.
    pub fn put_u32(self, buf: &mut impl BufMut, value: u32) {
        match self {
            Self::Big => buf.put_u32(value),
            Self::Little => buf.put_u32_le(value),
        }
    }

    /// Consume a `u16` from `buf`, returning `None` when fewer than two bytes remain.
    ///
    /// # Examples
    ///
    /// ```
    /// use hyperroute::byte_order::ByteOrder;
    ///
    /// let mut wire: &[u8] = &[0x12, 0x34];
    /// assert_eq!(ByteOrder::Big.get_u16(&mut wire), Some(0x1234));
    /// assert_eq!(ByteOrder::Big.get_u16(&mut wire), None);
    /// ```
    #[must_use]
    pub fn get_u16(self, buf: &mut impl Buf) -> Option<u16> {
        if buf.remaining() < 2 {
            return None;
        }
        Some(match self {
            Self::Big => buf.get_u16(),
            Self::Little => buf.get_u16_le(),
        })
    }

    /// Consume a `u32` from `buf`, returning `None` when fewer than four bytes remain.
    #[must_use]
    pub fn get_u32(self, buf: &mut impl Buf) -> Option<u32> {
        if buf.remaining() < 4 {
            return None;
        }
        Some(match self {
            Self::Big => buf.get_u32(),
            Self::Little => buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    //! Round-trip tests for configured byte-order helpers.

    use rstest::rstest;

    use super::ByteOrder;

    #[rstest]
    #[case::big(ByteOrder::Big, &[0x12, 0x34, 0x56, 0x78])]
    #[case::little(ByteOrder::Little, &[0x78, 0x56, 0x34, 0x12])]
    fn u32_round_trips_in_either_order(#[case] order: ByteOrder, #[case] expected: &[u8]) {
        let mut buf = Vec::new();
        order.put_u32(&mut buf, 0x1234_5678);
        assert_eq!(buf, expected);

        let mut wire = buf.as_slice();
        assert_eq!(order.get_u32(&mut wire), Some(0x1234_5678));
        assert!(wire.is_empty());
    }

    #[test]
    fn truncated_input_reads_none() {
        let mut wire: &[u8] = &[0x01, 0x02, 0x03];
        assert_eq!(ByteOrder::Little.get_u32(&mut wire), None);
        assert_eq!(wire.len(), 3, "a failed read must not consume input");
    }
}
