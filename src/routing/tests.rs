//! Unit tests for routing decisions.

use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::{
    config::{AnonymityConfig, RoutingConfig},
    id::NodeId,
    message::{MessageType, PROTOCOL_VERSION},
    test_helpers::{RecordingTransport, ScriptedSelector, outbound_to, peer},
};

const TARGET: u64 = 50;

fn routing_config() -> RoutingConfig {
    RoutingConfig {
        rng_seed: Some(7),
        ..RoutingConfig::default()
    }
}

fn manager_with(
    local: u64,
    selector: ScriptedSelector,
    routing: RoutingConfig,
    anonymity: AnonymityConfig,
) -> RoutingManager {
    RoutingManager::new(
        peer(local),
        routing,
        anonymity,
        Arc::new(selector),
        outbound_to(Arc::new(RecordingTransport::default())),
    )
}

fn forwarding_selector(next: u64) -> ScriptedSelector {
    ScriptedSelector::default().with_next_hop(NodeId::from_u64(TARGET), peer(next))
}

#[fixture]
fn manager() -> RoutingManager {
    manager_with(
        1,
        forwarding_selector(2),
        routing_config(),
        AnonymityConfig::default(),
    )
}

fn message(ttl: u16) -> Message {
    Message::builder(MessageType::Data, &peer(1), NodeId::from_u64(TARGET))
        .serial(1)
        .ttl(ttl)
        .payload(&b"payload"[..])
        .build()
}

#[rstest]
fn first_hop_uses_the_selector(manager: RoutingManager) {
    let decision = manager.route(SendInfo::local(message(8))).expect("routed");

    assert_eq!(decision.next_hop, peer(2));
    assert_eq!(decision.message.ttl, 7);
    assert_eq!(decision.message.hop_count, 1);
    assert_eq!(decision.message.version, PROTOCOL_VERSION);
}

#[rstest]
#[case(1)]
#[case(5)]
#[case(12)]
fn ttl_drops_by_exactly_one_per_hop(#[case] hops: u16) {
    let initial = 16;
    let mut msg = message(initial);
    for hop in 0..hops {
        let manager = manager_with(
            u64::from(hop) + 1,
            forwarding_selector(u64::from(hop) + 2),
            routing_config(),
            AnonymityConfig::default(),
        );
        let info = if hop == 0 {
            SendInfo::local(msg)
        } else {
            SendInfo::forward(msg, peer(u64::from(hop)))
        };
        msg = manager.route(info).expect("routed").message;
    }
    assert_eq!(msg.ttl, initial - hops);
    assert_eq!(msg.hop_count, hops);
}

#[rstest]
#[case::local(None)]
#[case::forwarded(Some(peer(9)))]
fn exhausted_ttl_is_always_dropped(manager: RoutingManager, #[case] from: Option<PeerPointer>) {
    let info = SendInfo {
        direct_sender: from,
        ..SendInfo::local(message(0))
    };
    assert_eq!(manager.route(info), Err(RouteDrop::TtlExhausted));
}

#[rstest]
fn missing_next_hop_is_a_drop(manager: RoutingManager) {
    let mut msg = message(8);
    msg.recipient = NodeId::from_u64(99);
    assert_eq!(
        manager.route(SendInfo::local(msg)),
        Err(RouteDrop::NoNextHop {
            target: NodeId::from_u64(99)
        })
    );
}

#[rstest]
fn own_target_routes_to_self(manager: RoutingManager) {
    let mut msg = message(8);
    msg.recipient = NodeId::from_u64(1);
    let decision = manager.route(SendInfo::local(msg)).expect("routed");
    assert_eq!(decision.next_hop, peer(1));
}

#[rstest]
fn explicit_direct_recipient_bypasses_selection(manager: RoutingManager) {
    let info = SendInfo::local(message(8)).with_direct_recipient(peer(7));
    assert_eq!(manager.route(info).expect("routed").next_hop, peer(7));
}

#[rstest]
#[case::registered(
    RoutingConfig { allow_registered_routes: false, ..routing_config() },
    RoutingParams { register_route: true, ..RoutingParams::default() },
    RouteDrop::RegisteredRoutesDisallowed
)]
#[case::anonymous(
    RoutingConfig { allow_anonymous_routes: false, ..routing_config() },
    RoutingParams { anonymous_route: true, ..RoutingParams::default() },
    RouteDrop::AnonymousRoutesDisallowed
)]
fn disallowed_modes_are_dropped(
    #[case] routing: RoutingConfig,
    #[case] params: RoutingParams,
    #[case] expected: RouteDrop,
) {
    let manager = manager_with(1, forwarding_selector(2), routing, AnonymityConfig::default());
    let info = SendInfo::local(message(8)).with_params(params);
    assert_eq!(manager.route(info), Err(expected));
}

#[test]
fn defaults_and_params_only_switch_flags_on() {
    let anonymity = AnonymityConfig {
        secure_routing: true,
        ..AnonymityConfig::default()
    };
    let manager = manager_with(1, forwarding_selector(2), routing_config(), anonymity);
    let mut msg = message(8);
    msg.flags.insert(MessageFlags::SKIP_RANDOM_NEXT_HOPS);
    let info = SendInfo::local(msg).with_params(RoutingParams::default());

    let routed = manager.route(info).expect("routed").message;
    assert!(routed.flags.contains(MessageFlags::SECURE_ROUTING));
    assert!(routed.flags.contains(MessageFlags::SKIP_RANDOM_NEXT_HOPS));
}

#[test]
fn selector_adjustments_are_persisted() {
    let selector = ScriptedSelector {
        force_secure_routing: true,
        ..forwarding_selector(2)
    };
    let manager = manager_with(1, selector, routing_config(), AnonymityConfig::default());
    let routed = manager.route(SendInfo::local(message(8))).expect("routed");
    assert!(routed.message.flags.contains(MessageFlags::SECURE_ROUTING));
}

fn transform_anonymity() -> AnonymityConfig {
    AnonymityConfig {
        ensure_steinhaus_point_anonymity: true,
        anonymity_required: true,
        steinhaus_point_anonymity_distance_factor: 0.5,
        ..AnonymityConfig::default()
    }
}

#[test]
fn distance_transform_points_at_the_second_candidate() {
    let selector = ScriptedSelector {
        candidates: vec![peer(2), peer(3)],
        closer_fraction: 0.75,
        ..forwarding_selector(2)
    };
    let manager = manager_with(1, selector, routing_config(), transform_anonymity());

    let routed = manager.route(SendInfo::local(message(8))).expect("routed").message;
    assert_eq!(routed.transform_origin, Some(NodeId::from_u64(3)));
    assert!(routed.flags.contains(MessageFlags::PREFIX_MISMATCH_HEURISTIC));
}

#[rstest]
#[case::below_threshold(0.25, vec![peer(2), peer(3)], Ok(None))]
#[case::too_few_candidates(0.75, vec![peer(2)], Err(RouteDrop::TransformCandidatesMissing))]
fn distance_transform_edge_cases(
    #[case] closer_fraction: f64,
    #[case] candidates: Vec<PeerPointer>,
    #[case] expected: Result<Option<NodeId>, RouteDrop>,
) {
    let selector = ScriptedSelector {
        candidates,
        closer_fraction,
        ..forwarding_selector(2)
    };
    let manager = manager_with(1, selector, routing_config(), transform_anonymity());
    let result = manager
        .route(SendInfo::local(message(8)))
        .map(|decision| decision.message.transform_origin);
    assert_eq!(result, expected);
}

#[rstest]
#[case::explicit_peer(false)]
#[case::route_back_reply(true)]
fn distance_transform_leaves_pinned_first_hops_alone(#[case] route_back: bool) {
    let selector = ScriptedSelector {
        candidates: Vec::new(),
        closer_fraction: 1.0,
        ..forwarding_selector(2)
    };
    let manager = manager_with(1, selector, routing_config(), transform_anonymity());
    let mut msg = message(8);
    msg.flags.set(MessageFlags::ROUTE_BACK, route_back);
    let info = SendInfo::local(msg).with_direct_recipient(peer(7));

    let decision = manager.route(info).expect("routed");
    assert_eq!(decision.next_hop, peer(7));
    assert_eq!(decision.message.transform_origin, None);
}

#[test]
fn concealed_hop_count_uses_the_sentinel_from_the_first_hop() {
    let anonymity = AnonymityConfig {
        conceal_hop_count: true,
        ..AnonymityConfig::default()
    };
    let manager = manager_with(1, forwarding_selector(2), routing_config(), anonymity);
    let routed = manager.route(SendInfo::local(message(8))).expect("routed").message;
    assert_eq!(routed.hop_count, HOP_COUNT_CONCEALED);

    let relay = manager_with(2, forwarding_selector(3), routing_config(), AnonymityConfig::default());
    let relayed = relay
        .route(SendInfo::forward(routed, peer(1)))
        .expect("routed")
        .message;
    assert_eq!(relayed.hop_count, HOP_COUNT_CONCEALED);
}

#[test]
fn anonymous_route_rewrites_the_sender_on_every_hop() {
    let relay = manager_with(2, forwarding_selector(3), routing_config(), AnonymityConfig::default());
    let mut msg = message(8);
    msg.flags.insert(MessageFlags::ANONYMOUS_ROUTE);
    msg.hop_count = 1;

    let relayed = relay
        .route(SendInfo::forward(msg, peer(1)))
        .expect("routed")
        .message;
    assert_eq!(relayed.sender, NodeId::from_u64(2));
    assert_eq!(relayed.sender_address, peer(2).address);
}

#[test]
fn registration_records_both_directions() {
    let relay = manager_with(2, forwarding_selector(3), routing_config(), AnonymityConfig::default());
    let mut msg = message(8);
    msg.flags.insert(MessageFlags::REGISTER_ROUTE);
    msg.route_id = 41;
    msg.hop_count = 1;
    let now = Instant::now();

    let routed = relay
        .route_at(SendInfo::forward(msg, peer(1)), now)
        .expect("routed")
        .message;
    let route = relay
        .get_registered_route_at(routed.route_id, now)
        .expect("route registered");

    assert_eq!(route.inbound, peer(1));
    assert_eq!(route.inbound_route_id, 41);
    assert_eq!(route.outbound, peer(3));
    assert_eq!(route.remote_id, NodeId::from_u64(TARGET));
    assert!(!route.origin);
    assert_eq!(routed.sender, NodeId::from_u64(2), "previous hop hidden");
}

fn registered_relay() -> (RoutingManager, u32, Instant) {
    let relay = manager_with(2, forwarding_selector(3), routing_config(), AnonymityConfig::default());
    let mut msg = message(8);
    msg.flags.insert(MessageFlags::REGISTER_ROUTE);
    msg.hop_count = 1;
    let now = Instant::now();
    let route_id = relay
        .route_at(SendInfo::forward(msg, peer(1)), now)
        .expect("routed")
        .message
        .route_id;
    (relay, route_id, now)
}

fn route_back_reply(route_id: u32) -> Message {
    let mut reply = Message::builder(MessageType::Data, &peer(3), NodeId::from_u64(2))
        .route_id(route_id)
        .flag(MessageFlags::ROUTE_BACK, true)
        .build();
    reply.hop_count = 1;
    reply
}

#[test]
fn route_back_retraces_the_registered_route() {
    let (relay, route_id, now) = registered_relay();

    let decision = relay
        .route_at(SendInfo::forward(route_back_reply(route_id), peer(3)), now)
        .expect("relayed");
    assert_eq!(decision.next_hop, peer(1));
    assert_eq!(decision.message.recipient, NodeId::from_u64(1));
    assert_eq!(decision.message.sender, NodeId::from_u64(2));
    assert_eq!(decision.message.route_id, 0);
}

#[test]
fn route_back_from_an_unexpected_peer_is_rejected() {
    let (relay, route_id, now) = registered_relay();
    assert_eq!(
        relay.route_at(SendInfo::forward(route_back_reply(route_id), peer(4)), now),
        Err(RouteDrop::RouteSenderMismatch {
            route_id,
            sender: NodeId::from_u64(4),
        })
    );
}

#[test]
fn route_back_on_an_expired_route_is_rejected() {
    let (relay, route_id, now) = registered_relay();
    let later = now + RoutingConfig::default().registered_routes_retention_time;
    assert_eq!(
        relay.route_at(SendInfo::forward(route_back_reply(route_id), peer(3)), later),
        Err(RouteDrop::UnknownRoute { route_id })
    );
    assert_eq!(relay.purge_expired_routes_at(later + Duration::from_secs(1)), 0);
}

#[tokio::test]
async fn route_message_reports_drops_as_false() {
    let manager = manager_with(
        1,
        forwarding_selector(2),
        routing_config(),
        AnonymityConfig::default(),
    );
    assert_eq!(manager.route_message(SendInfo::local(message(0)), true).await, Ok(false));
    assert_eq!(manager.route_message(SendInfo::local(message(4)), true).await, Ok(true));
}

#[tokio::test]
async fn closed_transport_is_an_error() {
    let manager = RoutingManager::new(
        peer(1),
        routing_config(),
        AnonymityConfig::default(),
        Arc::new(forwarding_selector(2)),
        outbound_to(Arc::new(RecordingTransport::closed())),
    );
    assert_eq!(
        manager.route_message(SendInfo::local(message(4)), true).await,
        Err(TransportError::Closed)
    );
}
