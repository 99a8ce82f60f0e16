#![cfg(not(loom))]
//! End-to-end delivery across a ring of in-memory nodes.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hyperroute::{
    DeliveryOutcome,
    MessageType,
    NodeId,
    OverlayConfig,
    PeerPointer,
    SendRequest,
    byte_order::ByteOrder,
    routing::RoutingParams,
};
use hyperroute_testing::{
    LoggerHandle,
    Network,
    StaticSelector,
    TestNode,
    delivery_report,
    logger,
};
use rstest::rstest;

const WAIT: Duration = Duration::from_secs(1);

fn ring(n: u64) -> (Network, Vec<TestNode>) {
    let network = Network::new();
    let nodes = network.spawn_ring(&Network::ring_of(n), &OverlayConfig::default());
    (network, nodes)
}

/// `(from, to, kind)` of every decodable frame, in transmission order.
fn hops(network: &Network) -> Vec<(u64, u64, MessageType)> {
    let index = |peer: &PeerPointer| {
        let bytes = peer.id.as_bytes();
        u64::from_be_bytes(bytes[12..].try_into().expect("eight bytes"))
    };
    network
        .captured()
        .iter()
        .filter_map(|c| {
            c.decode(ByteOrder::Big)
                .map(|m| (index(&c.from), index(&c.to), m.kind))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn data_reaches_recipient_and_sender_hears_back() {
    let (_network, mut nodes) = ring(3);
    let recipient = nodes[2].peer().id;
    let (callback, report) = delivery_report();

    let serial = nodes[0]
        .send(SendRequest::data(recipient, &b"hello"[..]).on_delivery(callback))
        .await
        .expect("send");

    let delivered = nodes[2].delivered_within(WAIT).await.expect("delivered");
    assert_eq!(delivered.payload, Bytes::from_static(b"hello"));
    assert_eq!(delivered.serial, serial);

    let report = tokio::time::timeout(WAIT, report)
        .await
        .expect("report in time")
        .expect("report sent");
    assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    assert_eq!(report.serial, serial);
    assert_eq!(report.resend_count, 0);
    assert!(!nodes[0].core().acks().is_pending(serial));
    assert!(nodes[1].drain_inbox().is_empty(), "relay keeps nothing");
}

#[tokio::test(start_paused = true)]
async fn registered_route_is_retraced_by_the_acknowledgment() {
    let (network, mut nodes) = ring(3);
    let recipient = nodes[2].peer().id;
    let params = RoutingParams {
        register_route: true,
        ..RoutingParams::default()
    };
    let (callback, report) = delivery_report();

    nodes[0]
        .send(
            SendRequest::data(recipient, &b"along"[..])
                .params(params)
                .on_delivery(callback),
        )
        .await
        .expect("send");
    nodes[2].delivered_within(WAIT).await.expect("delivered");
    let report = tokio::time::timeout(WAIT, report).await.expect("report").expect("sent");
    assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    assert_eq!(report.recipient, recipient);

    assert_eq!(
        hops(&network),
        vec![
            (1, 2, MessageType::Data),
            (2, 3, MessageType::Data),
            (3, 2, MessageType::DataAck),
            (2, 1, MessageType::DataAck),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn reply_along_a_registered_route_reaches_the_origin() {
    let (network, mut nodes) = ring(3);
    let (origin, replier) = (nodes[0].peer().id, nodes[2].peer().id);
    let params = RoutingParams {
        register_route: true,
        ..RoutingParams::default()
    };
    nodes[0]
        .send(SendRequest::data(replier, &b"ask"[..]).params(params))
        .await
        .expect("send");
    let received = nodes[2].delivered_within(WAIT).await.expect("delivered");
    tokio::time::sleep(WAIT).await;
    let before = hops(&network).len();

    let (callback, report) = delivery_report();
    nodes[2]
        .send(SendRequest::reply_along(&received, &b"answer"[..]).on_delivery(callback))
        .await
        .expect("reply");

    let reply = nodes[0].delivered_within(WAIT).await.expect("reply delivered");
    assert_eq!(reply.payload, Bytes::from_static(b"answer"));
    assert_eq!(reply.sender, replier);
    assert_eq!(reply.recipient, origin);
    assert!(reply.sender_address.is_empty());

    let report = tokio::time::timeout(WAIT, report).await.expect("report").expect("sent");
    assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    assert_eq!(
        hops(&network)[before..],
        [
            (3, 2, MessageType::Data),
            (2, 1, MessageType::Data),
            (1, 2, MessageType::DataAck),
            (2, 3, MessageType::DataAck),
        ]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn replayed_route_back_from_another_peer_is_rejected(mut logger: LoggerHandle) {
    let (network, mut nodes) = ring(3);
    let (origin, relay, replier) = (
        nodes[0].peer().clone(),
        nodes[1].peer().clone(),
        nodes[2].peer().clone(),
    );
    let params = RoutingParams {
        register_route: true,
        ..RoutingParams::default()
    };
    nodes[0]
        .send(SendRequest::data(replier.id, &b"once"[..]).params(params))
        .await
        .expect("send");
    nodes[2].delivered_within(WAIT).await.expect("delivered");
    tokio::time::sleep(WAIT).await;

    let ack = network
        .captured_between(&replier, &relay)
        .pop()
        .expect("acknowledgment on the return path");
    let relayed = network.captured_between(&relay, &origin).len();

    assert!(network.inject(&relay, origin.clone(), ack.clone()));
    tokio::time::sleep(WAIT).await;
    assert_eq!(network.captured_between(&relay, &origin).len(), relayed);
    assert!(logger.contains("sender mismatch"));

    assert!(network.inject(&relay, replier, ack));
    tokio::time::sleep(WAIT).await;
    assert_eq!(
        network.captured_between(&relay, &origin).len(),
        relayed + 1,
        "the hop the route recorded may still relay"
    );
}

#[rstest]
#[case::dies_at_relay(1, false)]
#[case::just_reaches(2, true)]
#[tokio::test(start_paused = true)]
async fn ttl_bounds_the_path(#[case] ttl: u16, #[case] arrives: bool) {
    let (_network, mut nodes) = ring(3);
    let recipient = nodes[2].peer().id;

    nodes[0]
        .send(SendRequest::data(recipient, &b"ttl"[..]).ttl(ttl))
        .await
        .expect("send");

    assert_eq!(nodes[2].delivered_within(WAIT).await.is_some(), arrives);
}

#[tokio::test(start_paused = true)]
async fn exhausted_ttl_never_leaves_the_sender() {
    let (network, nodes) = ring(2);
    let recipient = nodes[1].peer().id;

    let serial = nodes[0]
        .send(SendRequest::data(recipient, &b"none"[..]).ttl(0))
        .await
        .expect("dropped sends still return a serial");

    tokio::time::sleep(WAIT).await;
    assert!(network.captured().is_empty());
    assert!(serial > 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_further_sends() {
    let (_network, nodes) = ring(2);
    let recipient = nodes[1].peer().id;
    nodes[0].shutdown().await;

    let err = nodes[0]
        .send(SendRequest::data(recipient, &b"late"[..]))
        .await
        .expect_err("node is shut down");
    assert!(err.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn large_payload_is_fragmented_and_reassembled() {
    let mut config = OverlayConfig::default();
    config.fragments.fragment_length = 160;
    let network = Network::new();
    let mut nodes = network.spawn_ring(&Network::ring_of(3), &config);
    let payload: Vec<u8> = (0..2_000_u32).map(|i| (i % 251) as u8).collect();

    nodes[0]
        .send(SendRequest::data(nodes[2].peer().id, payload.clone()))
        .await
        .expect("send");

    let delivered = nodes[2].delivered_within(WAIT).await.expect("reassembled");
    assert_eq!(&delivered.payload[..], &payload[..]);
    assert!(network.captured_between(nodes[0].peer(), nodes[1].peer()).len() > 1);
    assert!(nodes[2].drain_inbox().is_empty(), "delivered exactly once");
}

#[tokio::test(start_paused = true)]
async fn message_without_a_next_hop_is_dropped_at_the_sender() {
    let network = Network::new();
    let local = Network::ring_of(1).remove(0);
    let node = network
        .spawn(local, &OverlayConfig::default(), Arc::new(StaticSelector::dead_end()))
        .expect("node");

    node.send(SendRequest::data(NodeId::from_u64(99), &b"nowhere"[..]))
        .await
        .expect("drops are not errors");

    tokio::time::sleep(WAIT).await;
    assert!(network.captured().is_empty());
}
