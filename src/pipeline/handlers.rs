//! Type handlers for DATA and DATA_ACK and the forwarding step.

use async_trait::async_trait;
use log::debug;

use super::{Core, Disposition, Envelope, Flow, Processor, ProcessorError};
use crate::message::MessageType;

/// Registers locally originated DATA messages for acknowledgment.
#[derive(Clone, Copy, Debug, Default)]
pub struct AckTracking;

#[async_trait]
impl Processor for AckTracking {
    fn name(&self) -> &'static str { "AckTracking" }

    fn accepts(&self, kind: MessageType) -> bool { kind == MessageType::Data }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        if envelope.direct_sender.is_none() {
            let callback = envelope.callback.take();
            core.acks()
                .process_send_data_message(&envelope.send_info(), callback);
        }
        Ok(Flow::Continue)
    }
}

/// Acknowledges DATA messages that reached their final recipient.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataHandler;

#[async_trait]
impl Processor for DataHandler {
    fn name(&self) -> &'static str { "Data" }

    fn accepts(&self, kind: MessageType) -> bool { kind == MessageType::Data }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        if envelope.disposition != Disposition::Deliver {
            return Ok(Flow::Continue);
        }
        if let Some(ack) = core
            .acks()
            .process_delivered_data_message(&envelope.message, envelope.direct_sender.as_ref())
        {
            core.route(ack).await?;
        }
        Ok(Flow::Continue)
    }
}

/// Settles pending messages from DATA_ACKs addressed to this node.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataAckHandler;

#[async_trait]
impl Processor for DataAckHandler {
    fn name(&self) -> &'static str { "DataAck" }

    fn accepts(&self, kind: MessageType) -> bool { kind == MessageType::DataAck }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        if envelope.disposition == Disposition::Deliver {
            core.acks().process_data_ack_message(&envelope.message);
            envelope.disposition = Disposition::Consumed;
        }
        Ok(Flow::Continue)
    }
}

/// Routes received messages that are not addressed to this node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Forwarder;

#[async_trait]
impl Processor for Forwarder {
    fn name(&self) -> &'static str { "Forward" }

    fn accepts(&self, _kind: MessageType) -> bool { true }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        let relaying = matches!(
            envelope.disposition,
            Disposition::Forward | Disposition::RelayBack
        );
        if !relaying || envelope.direct_sender.is_none() {
            return Ok(Flow::Continue);
        }
        let routed = core.route(envelope.send_info()).await?;
        debug!(
            "message relayed: serial={}, routed={routed}",
            envelope.message.serial
        );
        envelope.disposition = Disposition::Consumed;
        Ok(Flow::Continue)
    }
}
