//! One message awaiting acknowledgment.
//!
//! The entry's lock serialises its state transitions, so an acknowledgment
//! racing the retry sweep applies at most one terminal transition.

use std::sync::PoisonError;
#[cfg(not(loom))]
use std::sync::{Mutex, MutexGuard};

#[cfg(loom)]
use loom::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::DeliveryCallback;
use crate::routing::SendInfo;

/// Mutable part of a [`PendingAck`].
pub struct PendingState {
    /// What to route again on a resend.
    pub info: SendInfo,
    pub attempts_left: u32,
    pub resend_count: u32,
    pub deadline: Instant,
    pub callback: Option<DeliveryCallback>,
    pub processed: bool,
}

impl std::fmt::Debug for PendingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingState")
            .field("serial", &self.info.message.serial)
            .field("attempts_left", &self.attempts_left)
            .field("resend_count", &self.resend_count)
            .field("deadline", &self.deadline)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}

/// A tracked message and its retry state.
#[derive(Debug)]
pub struct PendingAck {
    serial: u32,
    state: Mutex<PendingState>,
}

impl PendingAck {
    #[must_use]
    pub fn new(
        info: SendInfo,
        attempts: u32,
        deadline: Instant,
        callback: Option<DeliveryCallback>,
    ) -> Self {
        Self {
            serial: info.message.serial,
            state: Mutex::new(PendingState {
                info,
                attempts_left: attempts,
                resend_count: 0,
                deadline,
                callback,
                processed: false,
            }),
        }
    }

    #[must_use]
    pub const fn serial(&self) -> u32 { self.serial }

    /// Lock the entry for a state transition.
    pub fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the terminal transition, once.
    ///
    /// Returns the callback (if any) and the resend count to the first
    /// caller; later callers get `None`.
    pub fn finish(&self) -> Option<(Option<DeliveryCallback>, u32)> {
        let mut state = self.lock();
        if state.processed {
            return None;
        }
        state.processed = true;
        Some((state.callback.take(), state.resend_count))
    }

    /// Whether a terminal transition has been applied.
    #[must_use]
    pub fn is_processed(&self) -> bool { self.lock().processed }
}
