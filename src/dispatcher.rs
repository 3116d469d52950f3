use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::GroupsConfig;
use crate::ids::MemberId;
use crate::membership::directory::{Group, MembershipDirectory};
use crate::membership::member::decode_member_info;
use crate::membership::member_events::LeaveReason;
use crate::message::assembler::{FragmentOutcome, MessageAssembler};
use crate::message::sender::ReliableSender;
use crate::net_time::net_time_loop::parse_net_time_payload;
use crate::net_time::NetTime;
use crate::packet::{Packet, PacketDecodeError, PacketType};
use crate::transport::{Transport, TransportError};
use crate::util::running_flag::RunningFlag;

/// Stale incomplete messages are checked for at most this often
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Routes received packets to the component responsible for their type.
///
/// Packets sent by this process's own members are dropped: with multicast loopback every node
///  receives its own packets. That includes members that left recently, since their last packets
///  may still arrive after they left.
pub struct MessageDispatcher {
    node_id: MemberId,
    directory: Arc<MembershipDirectory>,
    net_time: Arc<NetTime>,
    sender: Arc<ReliableSender>,
    transport: Arc<dyn Transport>,
    assembler: Mutex<MessageAssembler>,
}

impl MessageDispatcher {
    pub fn new(
        config: &GroupsConfig,
        node_id: MemberId,
        directory: Arc<MembershipDirectory>,
        sender: Arc<ReliableSender>,
        transport: Arc<dyn Transport>,
    ) -> MessageDispatcher {
        MessageDispatcher {
            node_id,
            net_time: directory.net_time().clone(),
            directory,
            sender,
            transport,
            assembler: Mutex::new(MessageAssembler::new(config.incomplete_message_timeout, config.max_message_size)),
        }
    }

    pub async fn on_datagram(&self, buf: &[u8]) {
        match Packet::decode(buf) {
            Ok(packet) => self.on_packet(packet).await,
            Err(PacketDecodeError::BadProtocolId(id)) => {
                warn!("received packet with foreign protocol id {:08x} - ignoring", id);
            }
            Err(e) => {
                error!("received malformed packet ({} bytes): {}", buf.len(), e);
            }
        }
    }

    pub async fn on_packet(&self, packet: Packet) {
        trace!("received {:?} packet from {:?} in group {:?}", packet.packet_type, packet.sender, packet.group_name);

        match packet.packet_type {
            PacketType::MessagePart | PacketType::MessageEnd => self.on_fragment(packet).await,
            PacketType::Acknowledgement => self.on_acknowledgement(packet).await,
            PacketType::MemberAnnouncement => self.on_announcement(packet).await,
            PacketType::MemberLeaving => self.on_leaving(packet).await,
            PacketType::NetTime => self.on_net_time(packet),
        }
    }

    async fn on_fragment(&self, packet: Packet) {
        let Some(group) = self.directory.get_group(&packet.group_name).await else {
            trace!("fragment for unknown group {:?} - ignoring", packet.group_name);
            return;
        };
        if self.is_own_member(&group, packet.sender).await {
            return;
        }

        let local_members = group.local_member_ids().await;
        if local_members.is_empty() {
            trace!("fragment for group {:?} without local members - ignoring", packet.group_name);
            return;
        }

        let outcome = match self.assembler.lock() {
            Ok(mut assembler) => assembler.on_fragment(&packet, Instant::now()),
            Err(_) => {
                error!("message assembler is poisoned - dropping fragment");
                return;
            }
        };

        if outcome.should_acknowledge() {
            // the sender waits for each of its group's members, so every local member acknowledges
            for member in local_members {
                self.send_acknowledgement(&packet, member).await;
            }
        }

        if let FragmentOutcome::Complete(message) = outcome {
            debug!("delivering message {:?} from {:?} in group {:?}", message.message_id, message.sender, message.group_name);
            group.notify_message(&message);
        }
    }

    async fn send_acknowledgement(&self, packet: &Packet, acking_member: MemberId) {
        let ack = packet.ack_for(acking_member);
        if let Err(e) = self.transport.send(&ack.encode()).await {
            error!("error acknowledging packet #{} of message {:?}: {}", packet.sequence_number, packet.message_id, e);
        }
    }

    async fn on_acknowledgement(&self, packet: Packet) {
        if self.is_own_traffic(&packet).await {
            return;
        }
        self.sender.on_acknowledgement(packet.message_id, packet.sender, packet.sequence_number).await;
    }

    async fn on_announcement(&self, packet: Packet) {
        if self.directory.is_departed_local_member(packet.sender) {
            trace!("announcement of departed local member {:?} - ignoring", packet.sender);
            return;
        }
        let group = self.directory.get_or_create_group(&packet.group_name).await;
        if group.is_local_member(packet.sender).await {
            return;
        }

        match decode_member_info(&packet.payload) {
            Ok(info) => group.on_announcement(packet.sender, info, self.net_time.current_time()).await,
            Err(e) => error!("malformed announcement from {:?} in group {:?}: {}", packet.sender, packet.group_name, e),
        }
    }

    async fn on_leaving(&self, packet: Packet) {
        let Some(group) = self.directory.get_group(&packet.group_name).await else {
            return;
        };
        if self.is_own_member(&group, packet.sender).await {
            return;
        }
        group.remove_member(packet.sender, LeaveReason::Left).await;
    }

    fn on_net_time(&self, packet: Packet) {
        if packet.sender == self.node_id {
            return;
        }
        match parse_net_time_payload(&packet.payload) {
            Some(remote_net_time) => {
                trace!("net time {} from {:?}", remote_net_time, packet.sender);
                self.net_time.update_from_remote(remote_net_time);
            }
            None => error!("malformed net time payload from {:?}: {} bytes", packet.sender, packet.payload.len()),
        }
    }

    async fn is_own_traffic(&self, packet: &Packet) -> bool {
        match self.directory.get_group(&packet.group_name).await {
            Some(group) => self.is_own_member(&group, packet.sender).await,
            None => self.directory.is_departed_local_member(packet.sender),
        }
    }

    async fn is_own_member(&self, group: &Group, sender: MemberId) -> bool {
        self.directory.is_departed_local_member(sender) || group.is_local_member(sender).await
    }

    pub fn expire_stale(&self, now: Instant) {
        match self.assembler.lock() {
            Ok(mut assembler) => assembler.expire_stale(now),
            Err(_) => error!("message assembler is poisoned"),
        }
    }
}

/// Receives packets until the running flag is cleared. The transport's read timeout bounds each
///  receive call, so the loop notices a cleared flag even if no packets arrive. Stopping should
///  also close the transport, which unblocks a pending receive.
pub async fn run_receive_loop(dispatcher: Arc<MessageDispatcher>, transport: Arc<dyn Transport>, running: RunningFlag) {
    info!("starting receive loop");

    let mut last_expiry_check = Instant::now();
    while running.is_running() {
        match transport.receive().await {
            Ok(buf) => dispatcher.on_datagram(&buf).await,
            Err(TransportError::Timeout) => {}
            Err(TransportError::Closed) if !running.is_running() => break,
            Err(TransportError::Closed) => {
                error!("transport was closed while the receive loop is running");
                select! {
                    _ = time::sleep(EXPIRY_CHECK_INTERVAL) => {}
                    _ = running.stopped() => break,
                }
            }
            Err(e) => error!("error receiving packet: {}", e),
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_expiry_check) >= EXPIRY_CHECK_INTERVAL {
            dispatcher.expire_stale(now);
            last_expiry_check = now;
        }
    }

    info!("receive loop terminated");
}
