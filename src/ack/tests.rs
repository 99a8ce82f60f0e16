use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::{
    id::{NetworkAddress, NodeId},
    test_helpers::peer,
};

const TIMEOUT: Duration = Duration::from_millis(300);

type Reports = Arc<Mutex<Vec<DeliveryReport>>>;

struct Harness {
    acks: AckManager,
    dispatcher: CallbackDispatcher,
    reports: Reports,
}

impl Harness {
    fn callback(&self) -> DeliveryCallback {
        let reports = Arc::clone(&self.reports);
        Box::new(move |report| reports.lock().expect("reports lock").push(report))
    }

    fn reports(&mut self) -> Vec<DeliveryReport> {
        self.dispatcher.drain();
        self.reports.lock().expect("reports lock").clone()
    }
}

fn harness_with(config: AckConfig) -> Harness {
    let (queue, dispatcher) = callback_queue();
    Harness {
        acks: AckManager::new(
            peer(1),
            config,
            ByteOrder::Big,
            Arc::new(SerialCounter::starting_at(1_000)),
            queue,
        ),
        dispatcher,
        reports: Arc::default(),
    }
}

#[fixture]
fn harness() -> Harness {
    harness_with(AckConfig {
        ack_timeout: TIMEOUT,
        send_attempts: 3,
        ..AckConfig::default()
    })
}

fn data(serial: u32) -> SendInfo {
    SendInfo::local(
        Message::builder(MessageType::Data, &peer(1), NodeId::from_u64(9))
            .serial(serial)
            .payload(&b"payload"[..])
            .build(),
    )
}

fn ack_for(serial: u32, from: &PeerPointer) -> Message {
    Message::builder(MessageType::DataAck, from, NodeId::from_u64(1))
        .serial(77)
        .payload(serial.to_be_bytes().to_vec())
        .build()
}

#[rstest]
fn retries_are_bounded_and_report_undelivered_once(mut harness: Harness) {
    let start = Instant::now();
    assert!(harness.acks.process_send_data_message_at(&data(5), Some(harness.callback()), start));

    let mut resend_times = Vec::new();
    let mut now = start;
    for _ in 0..40 {
        now += Duration::from_millis(50);
        if !harness.acks.process_awaiting_acks_at(now).is_empty() {
            resend_times.push(now);
        }
    }

    assert_eq!(resend_times.len(), 3);
    let mut previous = start;
    for at in &resend_times {
        assert!(*at - previous >= TIMEOUT);
        previous = *at;
    }
    let reports = harness.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, DeliveryOutcome::Undelivered);
    assert_eq!(reports[0].resend_count, 3);
    assert!(!harness.acks.is_pending(5));

    assert!(harness.acks.process_awaiting_acks_at(now + TIMEOUT * 10).is_empty());
    assert_eq!(harness.reports().len(), 1);
}

#[rstest]
fn acknowledgment_settles_once(mut harness: Harness) {
    let now = Instant::now();
    harness.acks.process_send_data_message_at(&data(6), Some(harness.callback()), now);

    assert!(harness.acks.process_data_ack_message(&ack_for(6, &peer(9))));
    assert!(!harness.acks.process_data_ack_message(&ack_for(6, &peer(9))));
    assert!(harness.acks.process_awaiting_acks_at(now + TIMEOUT * 10).is_empty());

    let reports = harness.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, DeliveryOutcome::Delivered);
    assert_eq!(reports[0].recipient, NodeId::from_u64(9));
    assert_eq!(harness.acks.pending_len(), 0);
}

#[rstest]
fn resends_escalate_routing_modes(harness: Harness) {
    let start = Instant::now();
    harness.acks.process_send_data_message_at(&data(7), None, start);

    let first = harness.acks.process_awaiting_acks_at(start + TIMEOUT);
    let params = first[0].params.expect("escalated params");
    assert!(params.secure_routing, "secure routing after one resend");
    assert!(!params.skip_random_next_hops);

    let second = harness.acks.process_awaiting_acks_at(start + TIMEOUT * 2);
    let params = second[0].params.expect("escalated params");
    assert!(params.secure_routing);
    assert!(params.skip_random_next_hops, "skipping after two resends");
}

#[rstest]
fn resends_keep_the_original_hop_state(harness: Harness) {
    let start = Instant::now();
    let info = data(8);
    harness.acks.process_send_data_message_at(&info, None, start);

    let resent = harness.acks.process_awaiting_acks_at(start + TIMEOUT);
    assert_eq!(resent[0].message, info.message);
    assert!(resent[0].direct_sender.is_none());
}

#[test]
fn ack_from_another_node_is_ignored_when_validating() {
    let mut harness = harness_with(AckConfig {
        validate_ack_sender: true,
        ..AckConfig::default()
    });
    harness.acks.process_send_data_message(&data(9), Some(harness.callback()));

    assert!(!harness.acks.process_data_ack_message(&ack_for(9, &peer(4))));
    assert!(harness.acks.is_pending(9));
    assert!(harness.acks.process_data_ack_message(&ack_for(9, &peer(9))));
    assert_eq!(harness.reports()[0].outcome, DeliveryOutcome::Delivered);
}

#[rstest]
#[case::anonymous_unregistered(RoutingParams { anonymous_route: true, ..RoutingParams::default() }, false)]
#[case::anonymous_registered(
    RoutingParams { anonymous_route: true, register_route: true, ..RoutingParams::default() },
    true
)]
#[case::plain(RoutingParams::default(), true)]
fn tracking_requires_a_return_path(
    harness: Harness,
    #[case] params: RoutingParams,
    #[case] tracked: bool,
) {
    let info = data(10).with_params(params);
    assert_eq!(harness.acks.process_send_data_message(&info, None), tracked);
    assert_eq!(harness.acks.is_pending(10), tracked);
}

#[test]
fn disabled_acknowledgments_track_nothing() {
    let harness = harness_with(AckConfig {
        enabled: false,
        ..AckConfig::default()
    });
    assert!(!harness.acks.process_send_data_message(&data(11), None));
    assert_eq!(harness.acks.pending_len(), 0);
}

#[rstest]
fn delivered_message_is_acked_to_its_advertised_sender(harness: Harness) {
    let origin = peer(3);
    let message = Message::builder(MessageType::Data, &origin, NodeId::from_u64(1))
        .serial(42)
        .build();

    let info = harness
        .acks
        .process_delivered_data_message(&message, Some(&peer(2)))
        .expect("acknowledgment");

    assert_eq!(info.direct_recipient, Some(origin.clone()));
    assert_eq!(info.message.kind, MessageType::DataAck);
    assert_eq!(info.message.recipient, origin.id);
    assert_eq!(info.message.serial, 1_000);
    assert_eq!(&info.message.payload[..], &42_u32.to_be_bytes());
}

#[rstest]
fn registered_route_is_acked_along_the_route(harness: Harness) {
    let relay = peer(2);
    let message = Message::builder(MessageType::Data, &relay, NodeId::from_u64(1))
        .serial(43)
        .route_id(555)
        .flag(MessageFlags::REGISTER_ROUTE, true)
        .build();

    let info = harness
        .acks
        .process_delivered_data_message(&message, Some(&relay))
        .expect("acknowledgment");

    assert!(info.message.is_route_back());
    assert_eq!(info.message.route_id, 555);
    assert_eq!(info.direct_recipient, Some(relay));
}

#[rstest]
fn delivery_without_a_sender_address_is_acked_by_identifier(harness: Harness) {
    let mut message = Message::builder(MessageType::Data, &peer(3), NodeId::from_u64(1))
        .serial(44)
        .build();
    message.sender_address = NetworkAddress::default();

    let info = harness
        .acks
        .process_delivered_data_message(&message, Some(&peer(2)))
        .expect("acknowledgment");

    assert_eq!(info.direct_recipient, None);
    assert_eq!(info.message.recipient, NodeId::from_u64(3));
}

#[rstest]
fn anonymous_unregistered_delivery_is_not_acked(harness: Harness) {
    let message = Message::builder(MessageType::Data, &peer(3), NodeId::from_u64(1))
        .flag(MessageFlags::ANONYMOUS_ROUTE, true)
        .build();
    assert!(
        harness
            .acks
            .process_delivered_data_message(&message, Some(&peer(2)))
            .is_none()
    );
}

#[rstest]
fn malformed_ack_payload_is_ignored(harness: Harness) {
    harness.acks.process_send_data_message(&data(12), None);
    let mut ack = ack_for(12, &peer(9));
    ack.payload = bytes::Bytes::from_static(&[0, 0]);
    assert!(!harness.acks.process_data_ack_message(&ack));
    assert!(harness.acks.is_pending(12));
}
