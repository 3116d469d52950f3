use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::GroupsConfig;
use crate::ids::{MemberId, MessageId};
use crate::membership::directory::Group;
use crate::packet::{Packet, PacketType};
use crate::transport::Transport;
use crate::util::safe_converter::PrecheckedCast;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SendError {
    /// Not all members acknowledged all packets within the send timeout. The message may still
    ///  have been received by some or all of them.
    #[error("message {message_id:?} was not acknowledged in time by {missing:?}")]
    Timeout { message_id: MessageId, missing: Vec<MemberId> },
    #[error("{member:?} is not a local member of group {group_name:?}")]
    NotALocalMember { member: MemberId, group_name: String },
    #[error("message size {size} exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
}

/// Splits a message's payload into packets of at most `max_fragment_payload` payload bytes. The
///  last packet is a MESSAGE_END, all others are MESSAGE_PART. An empty payload results in a
///  single, empty MESSAGE_END packet.
pub fn fragment_message(message_id: MessageId, sender: MemberId, group_name: &str, payload: Bytes, max_fragment_payload: usize) -> Vec<Packet> {
    let max_fragment_payload = max_fragment_payload.max(1);
    let num_fragments = payload.len().div_ceil(max_fragment_payload).max(1);

    (0..num_fragments)
        .map(|i| {
            let start = i * max_fragment_payload;
            let end = (start + max_fragment_payload).min(payload.len());
            Packet {
                message_id,
                sequence_number: i.prechecked_cast(),
                packet_type: if i + 1 == num_fragments { PacketType::MessageEnd } else { PacketType::MessagePart },
                sender,
                group_name: group_name.to_string(),
                payload: payload.slice(start..end),
            }
        })
        .collect()
}

/// A message that is currently being sent, with the members that acknowledged each of its
///  packets
struct OutboundMessage {
    packets: Vec<Packet>,
    /// indexed by sequence number
    acks: Mutex<Vec<FxHashSet<MemberId>>>,
    ack_received: Notify,
}

impl OutboundMessage {
    fn new(packets: Vec<Packet>) -> OutboundMessage {
        let acks = Mutex::new(vec![FxHashSet::default(); packets.len()]);
        OutboundMessage {
            packets,
            acks,
            ack_received: Notify::new(),
        }
    }

    /// returns `true` if this is a new acknowledgement
    fn apply_ack(&self, member: MemberId, sequence_number: u32) -> bool {
        let added = match self.acks.lock() {
            Ok(mut acks) => match acks.get_mut(sequence_number as usize) {
                Some(acked_by) => acked_by.insert(member),
                None => {
                    warn!("acknowledgement for non-existent packet #{} from {:?}", sequence_number, member);
                    false
                }
            },
            Err(_) => false,
        };
        if added {
            self.ack_received.notify_waiters();
        }
        added
    }

    /// The packets that were not yet acknowledged by all of `required`
    fn unacknowledged_packets(&self, required: &FxHashSet<MemberId>) -> Vec<&Packet> {
        match self.acks.lock() {
            Ok(acks) => self.packets.iter()
                .zip(acks.iter())
                .filter(|(_, acked_by)| !acked_by.is_superset(required))
                .map(|(p, _)| p)
                .collect(),
            Err(_) => self.packets.iter().collect(),
        }
    }

    fn is_fully_acknowledged(&self, required: &FxHashSet<MemberId>) -> bool {
        match self.acks.lock() {
            Ok(acks) => acks.iter().all(|acked_by| acked_by.is_superset(required)),
            Err(_) => false,
        }
    }

    fn missing_members(&self, required: &FxHashSet<MemberId>) -> Vec<MemberId> {
        let mut result = match self.acks.lock() {
            Ok(acks) => required.iter()
                .filter(|&m| acks.iter().any(|acked_by| !acked_by.contains(m)))
                .cloned()
                .collect::<Vec<_>>(),
            Err(_) => required.iter().cloned().collect(),
        };
        result.sort();
        result
    }
}

/// Sends messages to all remote members of a group, re-sending unacknowledged packets until
///  every member acknowledged every packet or the send timeout expires.
///
/// The members that must acknowledge a message are the group's remote members when the send
///  starts. Members that leave or are evicted while the send is in progress are no longer
///  required, but members that join are not added.
pub struct ReliableSender {
    config: Arc<GroupsConfig>,
    transport: Arc<dyn Transport>,
    pending: RwLock<FxHashMap<MessageId, Arc<OutboundMessage>>>,
}

impl ReliableSender {
    pub fn new(config: Arc<GroupsConfig>, transport: Arc<dyn Transport>) -> ReliableSender {
        ReliableSender {
            config,
            transport,
            pending: Default::default(),
        }
    }

    pub fn max_fragment_payload(&self, group_name: &str) -> usize {
        self.config.max_packet_size.saturating_sub(Packet::header_len(group_name))
    }

    /// Returns when all remote members of the group acknowledged the message, or fails with
    ///  [SendError::Timeout] after the send timeout.
    pub async fn send(&self, group: &Group, sender: MemberId, payload: Bytes) -> Result<MessageId, SendError> {
        if !group.is_local_member(sender).await {
            return Err(SendError::NotALocalMember { member: sender, group_name: group.name().to_string() });
        }
        if payload.len() > self.config.max_message_size {
            return Err(SendError::MessageTooLarge { size: payload.len(), max: self.config.max_message_size });
        }

        let message_id = MessageId::random();
        let initial_members = group.remote_member_ids().await;
        if initial_members.is_empty() {
            debug!("no remote members in group {:?} - message {:?} is trivially delivered", group.name(), message_id);
            return Ok(message_id);
        }

        let packets = fragment_message(message_id, sender, group.name(), payload, self.max_fragment_payload(group.name()));
        debug!("sending message {:?} to group {:?}: {} packets, {} members", message_id, group.name(), packets.len(), initial_members.len());

        let outbound = Arc::new(OutboundMessage::new(packets));
        self.pending.write().await.insert(message_id, outbound.clone());

        let result = self.do_send(group, message_id, &outbound, &initial_members).await;

        self.pending.write().await.remove(&message_id);
        result.map(|_| message_id)
    }

    async fn do_send(&self, group: &Group, message_id: MessageId, outbound: &OutboundMessage, initial_members: &FxHashSet<MemberId>) -> Result<(), SendError> {
        for round in 0..self.config.num_send_rounds() {
            let required = Self::required_members(group, initial_members).await;
            let unacknowledged = outbound.unacknowledged_packets(&required);
            if unacknowledged.is_empty() {
                debug!("message {:?} acknowledged by all members", message_id);
                return Ok(());
            }

            trace!("message {:?}, round {}: transmitting {} packets", message_id, round, unacknowledged.len());
            for packet in unacknowledged {
                if let Err(e) = self.transport.send(&packet.encode()).await {
                    error!("error sending packet #{} of message {:?}: {}", packet.sequence_number, message_id, e);
                }
            }

            if self.await_acknowledgements(group, outbound, initial_members).await {
                debug!("message {:?} acknowledged by all members", message_id);
                return Ok(());
            }
        }

        let required = Self::required_members(group, initial_members).await;
        let missing = outbound.missing_members(&required);
        if missing.is_empty() {
            return Ok(());
        }
        warn!("message {:?} was not acknowledged in time by {:?}", message_id, missing);
        Err(SendError::Timeout { message_id, missing })
    }

    /// Waits for up to one resend interval, returning `true` as soon as all required members
    ///  acknowledged all packets
    async fn await_acknowledgements(&self, group: &Group, outbound: &OutboundMessage, initial_members: &FxHashSet<MemberId>) -> bool {
        let deadline = Instant::now() + self.config.resend_interval;
        loop {
            // registered before checking so that no acknowledgement or departure is missed in between
            let ack_received = outbound.ack_received.notified();
            let member_removed = group.member_removed();

            let required = Self::required_members(group, initial_members).await;
            if outbound.is_fully_acknowledged(&required) {
                return true;
            }

            select! {
                _ = ack_received => {}
                _ = member_removed => {}
                _ = time::sleep_until(deadline) => return false,
            }
        }
    }

    async fn required_members(group: &Group, initial_members: &FxHashSet<MemberId>) -> FxHashSet<MemberId> {
        let current = group.remote_member_ids().await;
        initial_members.intersection(&current)
            .cloned()
            .collect()
    }

    /// Applies an acknowledgement received from the network. Acknowledgements for messages that
    ///  are not (or no longer) being sent are ignored.
    pub async fn on_acknowledgement(&self, message_id: MessageId, acking_member: MemberId, sequence_number: u32) {
        let outbound = self.pending.read().await.get(&message_id).cloned();
        match outbound {
            Some(outbound) => {
                if outbound.apply_ack(acking_member, sequence_number) {
                    trace!("{:?} acknowledged packet #{} of message {:?}", acking_member, sequence_number, message_id);
                }
            }
            None => trace!("acknowledgement for message {:?} that is not pending - ignoring", message_id),
        }
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.read().await.len()
    }
}
