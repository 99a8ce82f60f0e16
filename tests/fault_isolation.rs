#![cfg(not(loom))]
//! Faults in one message or callback never stop the node.

use std::time::Duration;

use bytes::Bytes;
use hyperroute::{DeliveryOutcome, DeliveryReport, OverlayConfig, SendRequest};
use hyperroute_testing::{LoggerHandle, Network, TestNode, delivery_report, logger};
use rstest::rstest;

const WAIT: Duration = Duration::from_secs(1);

fn pair() -> (Network, Vec<TestNode>) {
    let network = Network::new();
    let nodes = network.spawn_ring(&Network::ring_of(2), &OverlayConfig::default());
    (network, nodes)
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn malformed_frame_is_dropped_and_logged(mut logger: LoggerHandle) {
    let (network, mut nodes) = pair();
    let (sender, recipient) = (nodes[0].peer().clone(), nodes[1].peer().clone());

    network.inject(&recipient, sender.clone(), Bytes::from_static(&[0xde, 0xad]));
    nodes[0]
        .send(SendRequest::data(recipient.id, &b"after"[..]))
        .await
        .expect("send");

    let delivered = nodes[1].delivered_within(WAIT).await.expect("delivered");
    assert_eq!(delivered.payload, Bytes::from_static(b"after"));
    assert!(logger.contains("frame dropped"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn panicking_callback_does_not_stop_later_reports(mut logger: LoggerHandle) {
    let (_network, nodes) = pair();
    let recipient = nodes[1].peer().id;

    nodes[0]
        .send(
            SendRequest::data(recipient, &b"first"[..])
                .on_delivery(Box::new(|_: DeliveryReport| panic!("callback boom"))),
        )
        .await
        .expect("send");
    let (callback, report) = delivery_report();
    nodes[0]
        .send(SendRequest::data(recipient, &b"second"[..]).on_delivery(callback))
        .await
        .expect("send");

    let report = tokio::time::timeout(WAIT, report)
        .await
        .expect("report in time")
        .expect("report sent");
    assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    assert!(logger.contains("delivery callback panicked"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn message_for_a_closed_inbox_is_dropped_quietly() {
    let (_network, mut nodes) = pair();
    let recipient = nodes[1].peer().id;
    nodes[1].inbox.close();

    let (callback, report) = delivery_report();
    nodes[0]
        .send(SendRequest::data(recipient, &b"unread"[..]).on_delivery(callback))
        .await
        .expect("send");

    let report = tokio::time::timeout(WAIT, report)
        .await
        .expect("report in time")
        .expect("report sent");
    assert_eq!(
        report.outcome,
        DeliveryOutcome::Delivered,
        "acknowledgment precedes hand-off to the application"
    );
}
