//! Sliding-window limits on processed messages.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use super::{Core, Envelope, Flow, Processor, ProcessorError};
use crate::{config::RateLimitConfig, message::MessageType, window::RateWindow};

/// Drops messages once a window's maximum has been reached.
///
/// A type with its own limit is counted only in its own window; every other
/// type shares the global window. Without a matching window messages pass.
#[derive(Debug)]
pub struct RateLimitFilter {
    global: Option<RateWindow>,
    per_type: HashMap<MessageType, RateWindow>,
}

impl RateLimitFilter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let period = config.rate_limit_window;
        Self {
            global: config
                .limit_max_processed_messages_rate
                .map(|limit| RateWindow::new(period, limit)),
            per_type: config
                .per_type_limits
                .iter()
                .map(|(kind, limit)| (*kind, RateWindow::new(period, *limit)))
                .collect(),
        }
    }

    fn window(&self, kind: MessageType) -> Option<&RateWindow> {
        self.per_type.get(&kind).or(self.global.as_ref())
    }
}

#[async_trait]
impl Processor for RateLimitFilter {
    fn name(&self) -> &'static str { "RateLimit" }

    fn accepts(&self, _kind: MessageType) -> bool { true }

    async fn process(&self, _core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        let kind = envelope.message.kind;
        let Some(window) = self.window(kind) else {
            return Ok(Flow::Continue);
        };
        if window.try_acquire() {
            return Ok(Flow::Continue);
        }
        debug!(
            "rate limited: serial={}, type={kind}, limit={}",
            envelope.message.serial,
            window.limit()
        );
        crate::metrics::inc_dropped("rate_limited");
        Ok(Flow::Stop)
    }

    fn purge_expired_at(&self, now: Instant) {
        if let Some(global) = &self.global {
            global.purge_expired_at(now);
        }
        for window in self.per_type.values() {
            window.purge_expired_at(now);
        }
    }
}
