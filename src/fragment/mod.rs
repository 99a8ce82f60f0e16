//! Splitting of oversized messages and inbound reassembly.
//!
//! Outbound, [`Fragmenter`] cuts a message into fragments that each fit the
//! configured fragment length. Inbound, [`Reassembler`] collects fragments by
//! [`AssemblyKey`] until every slot is filled. Fragment position travels in
//! header extension slot 0 as a [`FragmentExtension`].

pub mod error;
pub mod fragmenter;
pub mod header;
pub mod reassembler;

pub use error::{FragmentationError, ReassemblyError};
pub use fragmenter::Fragmenter;
pub use header::{FRAGMENT_EXTENSION_LEN, FragmentExtension};
pub use reassembler::{AssemblyKey, Reassembler};
