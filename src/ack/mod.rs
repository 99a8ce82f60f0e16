//! Acknowledgment tracking and bounded retry.
//!
//! Every tracked DATA message moves through a small state machine:
//!
//! * **Sent**: waiting for a DATA_ACK until its deadline.
//! * **Resent**: the deadline passed with attempts left; the message is
//!   routed again with a fresh deadline, escalating to secure routing and
//!   next-hop skipping once the configured resend counts are reached.
//! * **Delivered** / **Undelivered**: terminal; the delivery callback is
//!   queued exactly once.
//!
//! The manager never touches the network. Operations return the
//! [`SendInfo`]s the node must route, which keeps the bookkeeping synchronous
//! and testable with explicit instants.

use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::time::Instant;

use crate::{
    byte_order::ByteOrder,
    config::AckConfig,
    id::PeerPointer,
    message::{Message, MessageFlags, MessageType, SerialCounter},
    routing::{RoutingParams, SendInfo},
};

mod callback;
mod pending;

pub use callback::{
    CallbackDispatcher,
    CallbackQueue,
    DeliveryCallback,
    DeliveryOutcome,
    DeliveryReport,
    callback_queue,
};
pub use pending::{PendingAck, PendingState};

#[cfg(test)]
mod tests;

/// Length of a DATA_ACK payload: the acknowledged serial.
pub const ACK_PAYLOAD_LEN: usize = 4;

/// Tracks messages awaiting acknowledgment.
#[derive(Debug)]
pub struct AckManager {
    local: PeerPointer,
    config: AckConfig,
    byte_order: ByteOrder,
    serials: Arc<SerialCounter>,
    callbacks: CallbackQueue,
    pending: DashMap<u32, Arc<PendingAck>>,
}

enum Step {
    Wait,
    Resend(SendInfo),
    Expire,
}

impl AckManager {
    #[must_use]
    pub fn new(
        local: PeerPointer,
        config: AckConfig,
        byte_order: ByteOrder,
        serials: Arc<SerialCounter>,
        callbacks: CallbackQueue,
    ) -> Self {
        Self {
            local,
            config,
            byte_order,
            serials,
            callbacks,
            pending: DashMap::new(),
        }
    }

    /// Number of messages still awaiting acknowledgment.
    #[must_use]
    pub fn pending_len(&self) -> usize { self.pending.len() }

    /// Whether the message with `serial` is still awaiting acknowledgment.
    #[must_use]
    pub fn is_pending(&self, serial: u32) -> bool { self.pending.contains_key(&serial) }

    /// Start tracking a locally originated DATA message.
    ///
    /// Returns `false` when the message is not tracked: acknowledgments are
    /// disabled, the message is not DATA, or it travels an anonymous route
    /// without a registered return path. An untracked message's callback is
    /// dropped without running.
    pub fn process_send_data_message(
        &self,
        info: &SendInfo,
        callback: Option<DeliveryCallback>,
    ) -> bool {
        self.process_send_data_message_at(info, callback, Instant::now())
    }

    pub fn process_send_data_message_at(
        &self,
        info: &SendInfo,
        callback: Option<DeliveryCallback>,
        now: Instant,
    ) -> bool {
        let message = &info.message;
        if !self.config.enabled || message.kind != MessageType::Data || lacks_return_path(info) {
            return false;
        }
        let entry = PendingAck::new(
            info.clone(),
            self.config.send_attempts,
            now + self.config.ack_timeout,
            callback,
        );
        if let Some(previous) = self.pending.insert(message.serial, Arc::new(entry)) {
            warn!(
                "pending acknowledgment replaced: serial={}",
                previous.serial()
            );
        }
        debug!(
            "awaiting acknowledgment: serial={}, recipient={}",
            message.serial, message.recipient
        );
        true
    }

    /// Build the DATA_ACK for a DATA message that reached this node.
    ///
    /// The acknowledgment travels back along the registered route when the
    /// message registered one and the configuration asks for it, otherwise
    /// directly to the advertised sender address. Without a known sender
    /// address the acknowledgment is routed by identifier. Returns `None` when the
    /// message came over an anonymous route without a return path.
    #[must_use]
    pub fn process_delivered_data_message(
        &self,
        message: &Message,
        direct_sender: Option<&PeerPointer>,
    ) -> Option<SendInfo> {
        if message.lacks_return_path() {
            debug!("acknowledgment skipped: serial={}, reason=no return path", message.serial);
            return None;
        }
        let mut payload = BytesMut::with_capacity(ACK_PAYLOAD_LEN);
        self.byte_order.put_u32(&mut payload, message.serial);
        let ack = Message::builder(MessageType::DataAck, &self.local, message.sender)
            .serial(self.serials.allocate())
            .payload(payload.freeze());

        let along_route = self.config.acknowledge_along_registered_route
            && message.is_register_route();
        let info = match direct_sender {
            Some(previous_hop) if along_route => {
                let ack = ack
                    .route_id(message.route_id)
                    .flag(MessageFlags::ROUTE_BACK, true)
                    .flag(
                        MessageFlags::ANONYMOUS_ROUTE,
                        message.is_anonymous_route(),
                    )
                    .build();
                SendInfo::local(ack).with_direct_recipient(previous_hop.clone())
            }
            _ if message.sender_address.is_empty() => SendInfo::local(ack.build()),
            _ => SendInfo::local(ack.build()).with_direct_recipient(PeerPointer::new(
                message.sender,
                message.sender_address.clone(),
            )),
        };
        Some(info)
    }

    /// Settle the pending message acknowledged by `ack`.
    ///
    /// Returns `true` when a pending message was marked delivered. Malformed
    /// payloads, unknown serials, repeated acknowledgments and (with
    /// `ValidateAckSender`) acknowledgments from anyone other than the
    /// original recipient are ignored.
    pub fn process_data_ack_message(&self, ack: &Message) -> bool {
        let Some(serial) = self.byte_order.get_u32(&mut &ack.payload[..]) else {
            debug!("acknowledgment ignored: serial={}, reason=malformed payload", ack.serial);
            return false;
        };
        let Some(entry) = self.pending.get(&serial).map(|e| Arc::clone(e.value())) else {
            debug!("acknowledgment ignored: acked={serial}, reason=not pending");
            return false;
        };
        if self.config.validate_ack_sender {
            let recipient = entry.lock().info.message.recipient;
            if ack.sender != recipient {
                warn!(
                    "acknowledgment ignored: acked={serial}, sender={}, expected={recipient}",
                    ack.sender
                );
                return false;
            }
        }
        let Some((callback, resend_count)) = entry.finish() else {
            return false;
        };
        self.pending
            .remove_if(&serial, |_, current| Arc::ptr_eq(current, &entry));
        let recipient = entry.lock().info.message.recipient;
        self.settle(
            callback,
            DeliveryReport {
                serial,
                recipient,
                outcome: DeliveryOutcome::Delivered,
                resend_count,
            },
        );
        true
    }

    /// Sweep every pending message against the current time.
    pub fn process_awaiting_acks(&self) -> Vec<SendInfo> {
        self.process_awaiting_acks_at(Instant::now())
    }

    /// Sweep every pending message against `now`.
    ///
    /// Returns the messages to resend. Messages out of attempts are reported
    /// undelivered and forgotten.
    pub fn process_awaiting_acks_at(&self, now: Instant) -> Vec<SendInfo> {
        let entries: Vec<Arc<PendingAck>> =
            self.pending.iter().map(|e| Arc::clone(e.value())).collect();
        let mut resends = Vec::new();
        for entry in entries {
            match self.step(&entry, now) {
                Step::Wait => {}
                Step::Resend(info) => resends.push(info),
                Step::Expire => self.expire(&entry),
            }
        }
        resends
    }

    fn step(&self, entry: &PendingAck, now: Instant) -> Step {
        let mut state = entry.lock();
        if state.processed || now < state.deadline {
            return Step::Wait;
        }
        if state.attempts_left == 0 {
            return Step::Expire;
        }
        state.attempts_left -= 1;
        state.resend_count += 1;
        state.deadline = now + self.config.ack_timeout;

        let resends = state.resend_count;
        let reached = |threshold: Option<u32>| threshold.is_some_and(|t| resends >= t);
        let mut params = state.info.params.unwrap_or_default();
        params.secure_routing |= reached(self.config.apply_secure_routing_after_not_delivered_count);
        params.skip_random_next_hops |=
            reached(self.config.apply_skipping_next_hops_after_not_delivered_count);
        if params != RoutingParams::default() {
            state.info.params = Some(params);
        }
        debug!(
            "resending unacknowledged message: serial={}, resend={resends}, attempts_left={}",
            entry.serial(),
            state.attempts_left
        );
        crate::metrics::inc_resent();
        Step::Resend(state.info.clone())
    }

    fn expire(&self, entry: &Arc<PendingAck>) {
        let Some((callback, resend_count)) = entry.finish() else {
            return;
        };
        let serial = entry.serial();
        self.pending
            .remove_if(&serial, |_, current| Arc::ptr_eq(current, entry));
        let recipient = entry.lock().info.message.recipient;
        warn!("message undelivered: serial={serial}, recipient={recipient}, resends={resend_count}");
        self.settle(
            callback,
            DeliveryReport {
                serial,
                recipient,
                outcome: DeliveryOutcome::Undelivered,
                resend_count,
            },
        );
    }

    fn settle(&self, callback: Option<DeliveryCallback>, report: DeliveryReport) {
        crate::metrics::inc_deliveries(report.outcome);
        if let Some(callback) = callback {
            self.callbacks.enqueue(callback, report);
        }
    }
}

/// Whether `info` will leave on an anonymous route that registers no
/// return path, taking its per-call overrides into account.
fn lacks_return_path(info: &SendInfo) -> bool {
    let params = info.params.unwrap_or_default();
    let anonymous = info.message.is_anonymous_route() || params.anonymous_route;
    let registered = info.message.is_register_route() || params.register_route;
    anonymous && !registered
}
