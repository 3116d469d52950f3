use std::sync::Arc;

use tokio::select;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace};

use crate::config::GroupsConfig;
use crate::ids::MemberId;
use crate::membership::directory::{Group, MembershipDirectory};
use crate::membership::member::{encode_member_info, Member};
use crate::packet::{Packet, PacketType};
use crate::transport::Transport;
use crate::util::running_flag::RunningFlag;

pub fn announcement_packet(group_name: &str, member: &Member) -> Packet {
    Packet::control(PacketType::MemberAnnouncement, member.id(), group_name, encode_member_info(member.info()))
}

pub fn leaving_packet(group_name: &str, member_id: MemberId) -> Packet {
    Packet::control(PacketType::MemberLeaving, member_id, group_name, Default::default())
}

/// Announces all local members at their announce interval, and evicts remote members that
///  were not heard from for too long.
///
/// The loop wakes up at a fixed tick rather than at the announce interval. Members are
///  announced on the last tick that keeps the time between announcements within the interval.
pub async fn run_announcer_loop(
    config: Arc<GroupsConfig>,
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn Transport>,
    running: RunningFlag,
) {
    info!("starting membership announcer");

    let mut ticks = time::interval(config.announce_tick);
    while running.is_running() {
        select! {
            _ = ticks.tick() => {}
            _ = running.stopped() => break,
        }

        do_announce_tick(&config, &directory, transport.as_ref(), Instant::now()).await;
    }

    info!("membership announcer terminated");
}

pub async fn do_announce_tick(config: &GroupsConfig, directory: &MembershipDirectory, transport: &dyn Transport, now: Instant) {
    for group in directory.groups().await {
        announce_due_members(config, &group, transport, now).await;

        if group.num_members().await > 0 {
            directory.evict_expired_members(&group).await;
        }
    }
}

async fn announce_due_members(config: &GroupsConfig, group: &Group, transport: &dyn Transport, now: Instant) {
    for member in group.local_members_due_for_announcement(now, config.member_announce_interval, config.announce_tick).await {
        trace!("announcing member {:?} in group {:?}", member.id(), group.name());

        let packet = announcement_packet(group.name(), &member);
        match transport.send(&packet.encode()).await {
            Ok(()) => group.mark_announced(member.id(), now).await,
            Err(e) => {
                // not marked as announced, so the next tick retries
                error!("error announcing member {:?} in group {:?}: {}", member.id(), group.name(), e);
            }
        }
    }
}

/// Sends a leave notice on a best effort basis: remote nodes that miss it evict the member
///  after the member timeout
pub async fn announce_leaving(group_name: &str, member_id: MemberId, transport: &dyn Transport) {
    debug!("sending leave notice for member {:?} in group {:?}", member_id, group_name);
    if let Err(e) = transport.send(&leaving_packet(group_name, member_id).encode()).await {
        error!("error sending leave notice for member {:?} in group {:?}: {}", member_id, group_name, e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;
    use mockall::predicate::always;
    use super::*;
    use crate::membership::member::{decode_member_info, MemberInfo};
    use crate::net_time::NetTime;
    use crate::transport::{MockTransport, TransportError};

    fn recording_transport(sent: Arc<Mutex<Vec<Packet>>>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .with(always())
            .returning(move |buf| {
                sent.lock().unwrap().push(Packet::decode(buf).unwrap());
                Ok(())
            });
        transport
    }

    async fn directory_with_local_member(config: &GroupsConfig) -> MembershipDirectory {
        let directory = MembershipDirectory::new(NetTime::new(), config.member_timeout());
        let group = directory.get_or_create_group("g").await;
        let mut info = MemberInfo::new();
        info.insert("name".to_string(), "alice".to_string());
        group.add_member(Member::new_local(MemberId(1), info, directory.net_time().current_time())).await;
        directory
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_at_interval() {
        let config = GroupsConfig::new();
        let directory = directory_with_local_member(&config).await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = recording_transport(sent.clone());

        let start = Instant::now();
        for secs in [0, 2, 4, 6, 8, 10] {
            do_announce_tick(&config, &directory, &transport, start + Duration::from_secs(secs)).await;
        }

        // announced at 0s, 4s and 8s: waiting for the 6s tick would exceed the 5s interval
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        for packet in sent.iter() {
            assert_eq!(packet.packet_type, PacketType::MemberAnnouncement);
            assert_eq!(packet.sender, MemberId(1));
            assert_eq!(packet.group_name, "g");
            assert_eq!(decode_member_info(&packet.payload).unwrap().get("name").map(|s| s.as_str()), Some("alice"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_announcement_is_retried() {
        let config = GroupsConfig::new();
        let directory = directory_with_local_member(&config).await;

        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Io(std::io::Error::other("network down"))));
        transport.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let start = Instant::now();
        do_announce_tick(&config, &directory, &transport, start).await;
        do_announce_tick(&config, &directory, &transport, start + Duration::from_secs(2)).await;
        do_announce_tick(&config, &directory, &transport, start + Duration::from_secs(4)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_evicts_expired_members() {
        let config = GroupsConfig::new();
        let directory = directory_with_local_member(&config).await;
        let net_time = directory.net_time().clone();
        let group = directory.get_group("g").await.unwrap();
        group.on_announcement(MemberId(2), MemberInfo::new(), net_time.time_ago(config.member_timeout() + Duration::from_secs(1))).await;

        let sent = Arc::new(Mutex::new(Vec::new()));
        do_announce_tick(&config, &directory, &recording_transport(sent), Instant::now()).await;

        assert!(!group.has_member(MemberId(2)).await);
        assert!(group.has_member(MemberId(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_terminates_on_stop() {
        let config = Arc::new(GroupsConfig::new());
        let directory = Arc::new(directory_with_local_member(&config).await);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let running = RunningFlag::new();

        let handle = tokio::spawn(run_announcer_loop(config, directory, Arc::new(recording_transport(sent.clone())), running.clone()));
        time::sleep(Duration::from_secs(11)).await;
        running.stop();
        handle.await.unwrap();

        // ticks at 0, 2, 4, 6, 8, 10s: announcements at 0s, 4s and 8s
        assert_eq!(sent.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_leaving_packet() {
        let packet = leaving_packet("g", MemberId(7));
        assert_eq!(packet.packet_type, PacketType::MemberLeaving);
        assert_eq!(packet.sender, MemberId(7));
        assert!(packet.payload.is_empty());
    }
}
