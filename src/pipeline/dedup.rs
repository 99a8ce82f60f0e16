//! Duplicate suppression at the final recipient.

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use super::{Core, Disposition, Envelope, Flow, Processor, ProcessorError};
use crate::{
    config::DedupConfig,
    message::{Message, MessageType},
    window::SeenWindow,
};

/// Identity of a delivered message for duplicate detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sender_hash: u32,
    pub serial: u32,
    pub route_id: u32,
    pub crc: Option<u32>,
}

impl DedupKey {
    #[must_use]
    pub fn of(message: &Message, include_crc: bool) -> Self {
        Self {
            sender_hash: message.sender.sender_hash(),
            serial: message.serial,
            route_id: message.route_id,
            crc: include_crc.then_some(message.crc),
        }
    }
}

/// Drops messages already delivered within the retention period.
///
/// A duplicate DATA message is acknowledged again before it is dropped: the
/// first copy was delivered, but its acknowledgment may have been lost.
#[derive(Debug)]
pub struct DuplicateFilter {
    enabled: bool,
    include_crc: bool,
    seen: SeenWindow<DedupKey>,
}

impl DuplicateFilter {
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            enabled: config.prevent_duplicates,
            include_crc: config.include_crc,
            seen: SeenWindow::new(config.retention_period, config.cache_max_size),
        }
    }

    /// Number of keys currently remembered.
    #[must_use]
    pub fn remembered(&self) -> usize { self.seen.len() }
}

#[async_trait]
impl Processor for DuplicateFilter {
    fn name(&self) -> &'static str { "Dedup" }

    fn accepts(&self, _kind: MessageType) -> bool { true }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        if !self.enabled || envelope.disposition != Disposition::Deliver {
            return Ok(Flow::Continue);
        }
        let message = &envelope.message;
        if self.seen.observe(DedupKey::of(message, self.include_crc)) {
            return Ok(Flow::Continue);
        }
        debug!(
            "duplicate dropped: serial={}, sender={}, route_id={}",
            message.serial, message.sender, message.route_id
        );
        crate::metrics::inc_dropped("duplicate");
        if message.kind == MessageType::Data
            && let Some(ack) = core
                .acks()
                .process_delivered_data_message(message, envelope.direct_sender.as_ref())
        {
            core.route(ack).await?;
        }
        Ok(Flow::Stop)
    }

    fn purge_expired_at(&self, now: Instant) { self.seen.purge_expired_at(now); }
}
