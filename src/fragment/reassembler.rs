//! Inbound helper that stitches fragments back into complete messages.
//!
//! [`Reassembler`] mirrors the outbound [`Fragmenter`](crate::fragment::Fragmenter)
//! by collecting fragment payloads into per-message slot arrays keyed by
//! [`AssemblyKey`]. Fragments may arrive in any order. Partial assemblies are
//! purged once older than the retention window; the table keeps an
//! arrival-ordered list so each purge touches only expired entries.
//!
//! The table lock is held only while slots are updated. Once an assembly is
//! complete it is removed from the table and its payload is concatenated
//! after the lock is released.

use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    fmt,
    sync::Mutex,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::time::Instant;

use super::{FragmentExtension, ReassemblyError};
use crate::{
    byte_order::ByteOrder,
    message::{FRAGMENT_SLOT, Message},
};

/// Identity of one logical message undergoing reassembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AssemblyKey {
    pub sender_hash: u32,
    pub serial: u32,
    pub route_id: u32,
}

impl AssemblyKey {
    /// Derive the key of `message`.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        Self {
            sender_hash: message.sender.sender_hash(),
            serial: message.serial,
            route_id: message.route_id,
        }
    }
}

impl fmt::Display for AssemblyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sender={:08x} serial={} route_id={}",
            self.sender_hash, self.serial, self.route_id
        )
    }
}

#[derive(Debug)]
struct PartialAssembly {
    header: Message,
    slots: Vec<Option<Bytes>>,
    filled: usize,
    started_at: Instant,
}

impl PartialAssembly {
    fn new(header: Message, total: u16, started_at: Instant) -> Self {
        Self {
            header,
            slots: vec![None; usize::from(total)],
            filled: 0,
            started_at,
        }
    }

    fn total(&self) -> usize { self.slots.len() }

    fn is_complete(&self) -> bool { self.filled == self.slots.len() }
}

#[derive(Debug, Default)]
struct AssemblyTable {
    assemblies: HashMap<AssemblyKey, PartialAssembly>,
    arrivals: VecDeque<(Instant, AssemblyKey)>,
}

impl AssemblyTable {
    fn purge_expired(&mut self, now: Instant, retention: Duration) -> Vec<AssemblyKey> {
        let mut evicted = Vec::new();
        while let Some((started_at, key)) = self.arrivals.front().copied() {
            if now.saturating_duration_since(started_at) < retention {
                break;
            }
            self.arrivals.pop_front();
            // Completed assemblies leave stale arrival records behind, and a
            // key may have been reused since; only evict the matching entry.
            if let Entry::Occupied(entry) = self.assemblies.entry(key)
                && entry.get().started_at == started_at
            {
                entry.remove();
                evicted.push(key);
            }
        }
        evicted
    }
}

/// Concurrent fragment reassembler with retention-based eviction.
#[derive(Debug)]
pub struct Reassembler {
    retention: Duration,
    prevent_duplicates: bool,
    byte_order: ByteOrder,
    table: Mutex<AssemblyTable>,
}

impl Reassembler {
    /// Create a reassembler evicting partial messages older than `retention`.
    ///
    /// When `prevent_duplicates` is set, a fragment refilling an occupied slot
    /// is dropped; otherwise it overwrites the slot.
    #[must_use]
    pub fn new(retention: Duration, prevent_duplicates: bool, byte_order: ByteOrder) -> Self {
        Self {
            retention,
            prevent_duplicates,
            byte_order,
            table: Mutex::new(AssemblyTable::default()),
        }
    }

    /// Feed an inbound message using the current time.
    ///
    /// See [`reassembly_message_at`](Self::reassembly_message_at).
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError`] when the fragment is dropped.
    pub fn reassembly_message(&self, message: Message) -> Result<Option<Message>, ReassemblyError> {
        self.reassembly_message_at(message, Instant::now())
    }

    /// Feed an inbound message using an explicit clock reading.
    ///
    /// Messages without a fragmentation extension are returned unchanged.
    /// Fragments return `Ok(None)` until the last missing slot is filled, at
    /// which point the assembled message is returned with the extension
    /// stripped.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError`] when the fragment descriptor is malformed
    /// or inconsistent with earlier fragments, or when the assembled payload
    /// fails its checksum.
    pub fn reassembly_message_at(
        &self,
        message: Message,
        now: Instant,
    ) -> Result<Option<Message>, ReassemblyError> {
        let Some(blob) = message.extensions.get(&FRAGMENT_SLOT) else {
            return Ok(Some(message));
        };
        let key = AssemblyKey::of(&message);
        let extension = FragmentExtension::decode(self.byte_order, blob)
            .ok_or(ReassemblyError::MalformedExtension {
                key,
                len: blob.len(),
            })?;
        let (index, total) = (extension.index(), extension.total());
        if total == 0 {
            return Err(ReassemblyError::ZeroTotal { key });
        }
        if index >= total {
            return Err(ReassemblyError::IndexOutOfRange { key, index, total });
        }

        let complete = {
            let mut guard = self.lock();
            let table = &mut *guard;
            table.purge_expired(now, self.retention);

            let assembly = match table.assemblies.entry(key) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    table.arrivals.push_back((now, key));
                    vacant.insert(PartialAssembly::new(message.clone(), total, now))
                }
            };

            if assembly.total() != usize::from(total) {
                return Err(ReassemblyError::TotalMismatch {
                    key,
                    expected: u16::try_from(assembly.total()).unwrap_or(u16::MAX),
                    found: total,
                });
            }

            let slot = &mut assembly.slots[usize::from(index)];
            if slot.is_some() {
                if self.prevent_duplicates {
                    debug!("duplicate fragment dropped: {key}, index={index}");
                    return Ok(None);
                }
                debug!("duplicate fragment overwrites slot: {key}, index={index}");
            } else {
                assembly.filled += 1;
            }
            *slot = Some(message.payload);

            if !assembly.is_complete() {
                return Ok(None);
            }
            table.assemblies.remove(&key)
        };

        complete.map(|assembly| Self::assemble(key, assembly)).transpose()
    }

    /// Remove partial messages older than the retention window.
    ///
    /// Returns the keys of evicted assemblies.
    pub fn purge_expired(&self) -> Vec<AssemblyKey> { self.purge_expired_at(Instant::now()) }

    /// Remove partial messages older than the retention window, using an
    /// explicit clock reading.
    pub fn purge_expired_at(&self, now: Instant) -> Vec<AssemblyKey> {
        let evicted = self.lock().purge_expired(now, self.retention);
        for key in &evicted {
            debug!("incomplete assembly purged: {key}");
        }
        evicted
    }

    /// Number of partial messages currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize { self.lock().assemblies.len() }

    fn assemble(key: AssemblyKey, assembly: PartialAssembly) -> Result<Message, ReassemblyError> {
        let PartialAssembly { header, slots, .. } = assembly;
        let len = slots.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(len);
        for piece in slots.into_iter().flatten() {
            payload.extend_from_slice(&piece);
        }

        let mut message = header.with_payload(payload.freeze());
        message.extensions.remove(&FRAGMENT_SLOT);
        if !message.checksum_matches() {
            return Err(ReassemblyError::ChecksumMismatch { key });
        }
        Ok(message)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AssemblyTable> {
        // A panic while holding the lock leaves slots consistent: every update
        // is a single assignment.
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
