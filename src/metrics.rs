//! Metric helpers for `hyperroute`.
//!
//! This module defines metric names and small helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to nothing.

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::ack::DeliveryOutcome;

/// Name of the counter tracking messages handed to the transport.
pub const MESSAGES_ROUTED: &str = "hyperroute_messages_routed_total";
/// Name of the counter tracking dropped messages, labelled by `reason`.
pub const MESSAGES_DROPPED: &str = "hyperroute_messages_dropped_total";
/// Name of the counter tracking acknowledgment-driven resends.
pub const MESSAGES_RESENT: &str = "hyperroute_messages_resent_total";
/// Name of the counter tracking final delivery outcomes, labelled by `outcome`.
pub const DELIVERIES: &str = "hyperroute_deliveries_total";

#[cfg(feature = "metrics")]
fn outcome_label(outcome: DeliveryOutcome) -> &'static str {
    match outcome {
        DeliveryOutcome::Delivered => "delivered",
        DeliveryOutcome::Undelivered => "undelivered",
    }
}

/// Record a message handed to the transport.
pub fn inc_routed() {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_ROUTED).increment(1);
}

/// Record a dropped message.
pub fn inc_dropped(reason: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_DROPPED, "reason" => reason).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

/// Record a resend triggered by a missing acknowledgment.
pub fn inc_resent() {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_RESENT).increment(1);
}

/// Record the final outcome of a tracked message.
pub fn inc_deliveries(outcome: DeliveryOutcome) {
    #[cfg(feature = "metrics")]
    counter!(DELIVERIES, "outcome" => outcome_label(outcome)).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}
