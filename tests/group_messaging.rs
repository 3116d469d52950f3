use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{self, Instant};
use tracing::Level;

use multicast_groups::config::GroupsConfig;
use multicast_groups::groups::Groups;
use multicast_groups::ids::MemberId;
use multicast_groups::membership::member::MemberInfo;
use multicast_groups::message::sender::SendError;
use multicast_groups::packet::{Packet, PacketType};
use multicast_groups::test_util::recording::{RecordingMemberListener, RecordingMessageListener};
use multicast_groups::transport::loopback::LoopbackNetwork;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const GROUP: &str = "chat";

struct Node {
    groups: Groups,
    member_id: MemberId,
    member_events: Arc<RecordingMemberListener>,
    messages: Arc<RecordingMessageListener>,
}

async fn start_node(network: &Arc<LoopbackNetwork>, config: GroupsConfig, read_timeout: Duration, name: &str) -> Node {
    let groups = Groups::new(config, Arc::new(network.new_transport(read_timeout))).unwrap();
    groups.start().await.unwrap();

    let member_events = RecordingMemberListener::new();
    let messages = RecordingMessageListener::new();
    groups.add_member_listener(GROUP, member_events.clone()).await;
    groups.add_message_listener(GROUP, messages.clone()).await;

    let mut info = MemberInfo::new();
    info.insert("name".to_string(), name.to_string());
    let member_id = groups.join_group(GROUP, info).await.unwrap();

    Node { groups, member_id, member_events, messages }
}

async fn start_default_node(network: &Arc<LoopbackNetwork>, name: &str) -> Node {
    start_node(network, GroupsConfig::new(), Duration::from_millis(500), name).await
}

fn packet_type(packet: &[u8]) -> Option<PacketType> {
    Packet::decode(packet).ok().map(|p| p.packet_type)
}

#[tokio::test(start_paused = true)]
async fn test_members_discover_each_other() {
    let network = LoopbackNetwork::new();
    let a = start_default_node(&network, "alice").await;
    let b = start_default_node(&network, "bob").await;

    // alice learns about bob from his initial announcement, bob has to wait for alice's
    //  next periodic announcement
    time::sleep(Duration::from_millis(100)).await;
    assert!(a.member_events.joined().contains(&b.member_id));
    assert!(!b.member_events.joined().contains(&a.member_id));

    time::sleep(Duration::from_secs(7)).await;
    assert!(a.member_events.joined().contains(&b.member_id));
    assert!(b.member_events.joined().contains(&a.member_id));

    let bob_seen_by_alice = a.groups.members(GROUP).await.into_iter()
        .find(|m| m.id() == b.member_id)
        .unwrap();
    assert!(!bob_seen_by_alice.is_local());
    assert_eq!(bob_seen_by_alice.info().get("name").map(|s| s.as_str()), Some("bob"));

    b.groups.stop().await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.member_events.left(), vec![b.member_id]);

    a.groups.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_message_to_all_members() {
    let network = LoopbackNetwork::new();
    let a = start_default_node(&network, "alice").await;
    let b = start_default_node(&network, "bob").await;
    let c = start_default_node(&network, "carol").await;
    time::sleep(Duration::from_millis(100)).await;

    let small = Bytes::from_static(b"hello, group");
    let large = Bytes::from((0..10_000).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    let empty = Bytes::new();

    for payload in [&small, &large, &empty] {
        a.groups.send_message(GROUP, a.member_id, payload.clone()).await.unwrap();
    }

    for receiver in [&b, &c] {
        assert!(receiver.messages.await_messages(3, Duration::from_secs(1)).await);
        assert_eq!(receiver.messages.payloads(), vec![small.to_vec(), large.to_vec(), empty.to_vec()]);
        assert!(receiver.messages.messages().iter().all(|m| m.sender == a.member_id && m.group_name == GROUP));
    }
    // a node does not receive its own messages
    assert!(a.messages.messages().is_empty());

    for node in [a, b, c] {
        node.groups.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_packets_are_resent() {
    let network = LoopbackNetwork::new();
    let a = start_default_node(&network, "alice").await;
    let b = start_default_node(&network, "bob").await;
    time::sleep(Duration::from_millis(100)).await;

    // drop the first transmission of the first three fragments, and the first few acknowledgements
    let dropped_fragments = AtomicUsize::new(0);
    let dropped_acks = AtomicUsize::new(0);
    network.set_drop_filter(move |p| match packet_type(p) {
        Some(PacketType::MessagePart) | Some(PacketType::MessageEnd) => dropped_fragments.fetch_add(1, Ordering::SeqCst) < 3,
        Some(PacketType::Acknowledgement) => dropped_acks.fetch_add(1, Ordering::SeqCst) < 2,
        _ => false,
    });

    let payload = Bytes::from(vec![42u8; 5_000]);
    let started = Instant::now();
    a.groups.send_message(GROUP, a.member_id, payload.clone()).await.unwrap();
    assert!(started.elapsed() >= a.groups.config().resend_interval);

    assert!(b.messages.await_messages(1, Duration::from_secs(1)).await);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(b.messages.payloads(), vec![payload.to_vec()]);

    network.clear_drop_filter();
    a.groups.stop().await;
    b.groups.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_times_out_without_acknowledgements() {
    let mut config = GroupsConfig::new();
    config.send_timeout = Duration::from_secs(4);
    config.resend_interval = Duration::from_secs(1);

    let network = LoopbackNetwork::new();
    let a = start_node(&network, config.clone(), Duration::from_millis(500), "alice").await;
    let b = start_node(&network, config, Duration::from_millis(500), "bob").await;
    time::sleep(Duration::from_millis(100)).await;

    network.set_drop_filter(|p| packet_type(p) == Some(PacketType::Acknowledgement));

    let started = Instant::now();
    let result = a.groups.send_message(GROUP, a.member_id, Bytes::from_static(b"anybody there?")).await;
    assert_eq!(started.elapsed(), Duration::from_secs(4));

    match result {
        Err(SendError::Timeout { missing, .. }) => assert_eq!(missing, vec![b.member_id]),
        other => panic!("unexpected result {:?}", other),
    }
    // the message arrived nonetheless, and retransmissions were not delivered again
    assert_eq!(b.messages.messages().len(), 1);

    network.clear_drop_filter();
    a.groups.stop().await;
    b.groups.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_group() {
    let network = LoopbackNetwork::new();
    let a = start_default_node(&network, "alice").await;
    let b = start_default_node(&network, "bob").await;
    time::sleep(Duration::from_millis(100)).await;

    b.groups.leave_group(GROUP, b.member_id).await.unwrap();
    time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.member_events.left(), vec![b.member_id]);
    assert!(!a.groups.directory().get_group(GROUP).await.unwrap().has_member(b.member_id).await);

    // with no remote members left, sending completes right away
    let started = Instant::now();
    a.groups.send_message(GROUP, a.member_id, Bytes::from_static(b"alone")).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);

    a.groups.stop().await;
    b.groups.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_a_net_time_source_emerges() {
    let network = LoopbackNetwork::new();
    let a = start_default_node(&network, "alice").await;
    let b = start_default_node(&network, "bob").await;

    time::sleep(Duration::from_secs(11)).await;
    assert!(a.groups.net_time().last_remote_update().is_some() || b.groups.net_time().last_remote_update().is_some());

    a.groups.stop().await;
    b.groups.stop().await;
}

/// Eviction is based on (wall clock based) net time, so this test runs in real time
#[tokio::test]
async fn test_silent_member_is_evicted() {
    let mut config = GroupsConfig::new();
    config.member_announce_interval = Duration::from_millis(200);
    config.member_grace_period = Duration::from_millis(300);
    config.announce_tick = Duration::from_millis(50);

    let network = LoopbackNetwork::new();
    let a = start_node(&network, config.clone(), Duration::from_millis(50), "alice").await;
    let b = start_node(&network, config, Duration::from_millis(50), "bob").await;

    // regular announcements keep the members alive
    time::sleep(Duration::from_millis(600)).await;
    assert!(a.member_events.left().is_empty());
    assert!(a.groups.directory().get_group(GROUP).await.unwrap().has_member(b.member_id).await);

    network.set_drop_filter(|p| matches!(packet_type(p), Some(PacketType::MemberAnnouncement) | Some(PacketType::MemberLeaving)));

    let deadline = Instant::now() + Duration::from_secs(3);
    while a.member_events.left().is_empty() && Instant::now() < deadline {
        time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(a.member_events.left(), vec![b.member_id]);
    // local members are never evicted
    assert!(a.groups.directory().get_group(GROUP).await.unwrap().is_local_member(a.member_id).await);

    a.groups.stop().await;
    b.groups.stop().await;
}
