//! Outbound helper that splits oversized messages into wire-sized fragments.
//!
//! [`Fragmenter`] clones the message header once per fragment and stamps each
//! copy with a [`FragmentExtension`] in slot
//! [`FRAGMENT_SLOT`](crate::message::FRAGMENT_SLOT). Messages that already
//! fit the configured fragment length pass through untouched.

use super::{FRAGMENT_EXTENSION_LEN, FragmentExtension, FragmentationError};
use crate::{
    codec::{EXTENSION_ENTRY_OVERHEAD, WireCodec},
    message::{FRAGMENT_SLOT, Message},
};

/// Splits messages into fragments no longer than a fixed encoded length.
#[derive(Clone, Copy, Debug)]
pub struct Fragmenter {
    fragment_length: usize,
    codec: WireCodec,
}

impl Fragmenter {
    /// Create a fragmenter producing frames of at most `fragment_length` bytes.
    #[must_use]
    pub const fn new(fragment_length: usize, codec: WireCodec) -> Self {
        Self {
            fragment_length,
            codec,
        }
    }

    /// Largest encoded frame this fragmenter produces.
    #[must_use]
    pub const fn fragment_length(&self) -> usize { self.fragment_length }

    /// Header length of a fragment of `message`, extension included.
    #[must_use]
    pub fn fragment_header_len(&self, message: &Message) -> usize {
        self.codec.header_len(message) + EXTENSION_ENTRY_OVERHEAD + FRAGMENT_EXTENSION_LEN
    }

    /// Split `message` into fragments when its encoding exceeds the fragment length.
    ///
    /// Returns a single-element vector holding the unchanged message when it
    /// already fits.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError`] when the header leaves no payload room,
    /// when more than `u16::MAX` fragments would be needed, or when the
    /// message is itself a fragment.
    pub fn fragment_message(&self, message: &Message) -> Result<Vec<Message>, FragmentationError> {
        if self.codec.encoded_len(message) <= self.fragment_length {
            return Ok(vec![message.clone()]);
        }
        if message.is_fragment() {
            return Err(FragmentationError::AlreadyFragmented);
        }
        self.fragment_with_header_len(message, self.fragment_header_len(message))
    }

    /// Split `message` assuming every fragment spends `header_len` bytes on its header.
    ///
    /// # Examples
    ///
    /// ```
    /// use hyperroute::{
    ///     codec::WireCodec,
    ///     fragment::Fragmenter,
    ///     id::{NodeId, PeerPointer},
    ///     message::{Message, MessageType},
    /// };
    ///
    /// let me = PeerPointer::new(NodeId::from_u64(1), "a");
    /// let msg = Message::builder(MessageType::Data, &me, NodeId::from_u64(2))
    ///     .payload(vec![7_u8; 200])
    ///     .build();
    /// let fragments = Fragmenter::new(128, WireCodec::default())
    ///     .fragment_with_header_len(&msg, 32)
    ///     .expect("fragment");
    /// assert_eq!(fragments.len(), 3);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::HeaderTooLarge`] when `header_len` is not
    /// below the fragment length and
    /// [`FragmentationError::TooManyFragments`] when the fragment count would
    /// not fit 16 bits.
    pub fn fragment_with_header_len(
        &self,
        message: &Message,
        header_len: usize,
    ) -> Result<Vec<Message>, FragmentationError> {
        let capacity = self.fragment_length.saturating_sub(header_len);
        if capacity == 0 {
            return Err(FragmentationError::HeaderTooLarge {
                header_len,
                fragment_length: self.fragment_length,
            });
        }

        let payload_len = message.payload.len();
        if payload_len <= capacity {
            return Ok(vec![message.clone()]);
        }

        let count = payload_len.div_ceil(capacity);
        let total =
            u16::try_from(count).map_err(|_| FragmentationError::TooManyFragments { count })?;

        let order = self.codec.byte_order();
        let fragments = (0..total)
            .map(|index| {
                let start = usize::from(index) * capacity;
                let end = (start + capacity).min(payload_len);
                let mut fragment = message.with_payload(message.payload.slice(start..end));
                fragment.extensions.insert(
                    FRAGMENT_SLOT,
                    FragmentExtension::new(index, total).encode(order),
                );
                fragment
            })
            .collect();
        Ok(fragments)
    }
}
