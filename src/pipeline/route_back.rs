//! Admission of messages travelling a registered route backwards.

use async_trait::async_trait;
use log::{debug, warn};

use super::{Core, Disposition, Envelope, Flow, Processor, ProcessorError};
use crate::{id::NetworkAddress, message::MessageType};

/// Validates route-back messages against the registered route table.
///
/// A route-back message is accepted only when this node is its declared
/// recipient and it arrived from the peer the route recorded as outbound.
/// The route's origin restores the route id and sender identity the message
/// had before registration, clears the relay-written sender address and
/// delivers it locally; every other node relays it one hop further back.
#[derive(Debug)]
pub struct RouteBackGate {
    process_on_route: bool,
}

impl RouteBackGate {
    /// With `process_on_route` set, relaying nodes run the message through
    /// the rest of the chain before passing it on.
    #[must_use]
    pub const fn new(process_on_route: bool) -> Self { Self { process_on_route } }
}

#[async_trait]
impl Processor for RouteBackGate {
    fn name(&self) -> &'static str { "RouteBack" }

    fn accepts(&self, _kind: MessageType) -> bool { true }

    async fn process(&self, core: &Core, envelope: &mut Envelope) -> Result<Flow, ProcessorError> {
        let message = &mut envelope.message;
        if !message.is_route_back() {
            return Ok(Flow::Continue);
        }
        let Some(direct_sender) = envelope.direct_sender.as_ref() else {
            return Ok(Flow::Continue);
        };
        let serial = message.serial;
        let route_id = message.route_id;
        if message.recipient != core.local().id {
            debug!("route-back dropped: serial={serial}, route_id={route_id}, reason=not addressed here");
            crate::metrics::inc_dropped("route_back_misaddressed");
            return Ok(Flow::Stop);
        }
        let Some(route) = core.routing().get_registered_route(route_id) else {
            warn!("route-back dropped: serial={serial}, route_id={route_id}, reason=unknown route");
            crate::metrics::inc_dropped("unknown_route");
            return Ok(Flow::Stop);
        };
        if *direct_sender != route.outbound {
            warn!(
                "route-back dropped: serial={serial}, route_id={route_id}, sender={}, reason=sender mismatch",
                direct_sender.id
            );
            crate::metrics::inc_dropped("route_sender_mismatch");
            return Ok(Flow::Stop);
        }

        if route.origin {
            message.route_id = route.inbound_route_id;
            message.sender = route.remote_id;
            // Relays rewrote the address; the remote's own is unknown here.
            message.sender_address = NetworkAddress::default();
            envelope.disposition = Disposition::Deliver;
            return Ok(Flow::Continue);
        }

        envelope.disposition = Disposition::RelayBack;
        if !self.process_on_route {
            core.route(envelope.send_info()).await?;
            envelope.disposition = Disposition::Consumed;
        }
        Ok(Flow::Continue)
    }
}
