//! Error types emitted by the fragmentation layer.
//!
//! Both directions surface precise diagnostics so the node can log why a
//! message or fragment was dropped.

use thiserror::Error;

use super::AssemblyKey;

/// Errors produced while fragmenting outbound messages.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FragmentationError {
    /// The header alone leaves no room for payload within a fragment.
    #[error("header of {header_len} bytes leaves no payload room in {fragment_length}-byte fragments")]
    HeaderTooLarge {
        header_len: usize,
        fragment_length: usize,
    },
    /// The payload would need more fragments than a 16-bit total can count.
    #[error("payload needs {count} fragments, more than the 16-bit limit")]
    TooManyFragments { count: usize },
    /// The message already carries fragmentation metadata.
    #[error("message is already a fragment")]
    AlreadyFragmented,
}

/// Errors produced while reassembling inbound fragments.
///
/// Every variant means the offending fragment was dropped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// The slot 0 extension is not a valid fragment descriptor.
    #[error("malformed fragment extension of {len} bytes for {key}")]
    MalformedExtension { key: AssemblyKey, len: usize },
    /// A fragment announced a total of zero fragments.
    #[error("fragment of {key} announces zero fragments")]
    ZeroTotal { key: AssemblyKey },
    /// The fragment index does not fall below the announced total.
    #[error("fragment index {index} out of range for {total} fragments of {key}")]
    IndexOutOfRange {
        key: AssemblyKey,
        index: u16,
        total: u16,
    },
    /// The fragment disagrees with the total announced by earlier fragments.
    #[error("fragment of {key} announces {found} fragments, expected {expected}")]
    TotalMismatch {
        key: AssemblyKey,
        expected: u16,
        found: u16,
    },
    /// The assembled payload does not match the header checksum.
    #[error("assembled payload of {key} fails its checksum")]
    ChecksumMismatch { key: AssemblyKey },
}
