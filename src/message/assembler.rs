use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::ids::{MemberId, MessageId};
use crate::message::ReceivedMessage;
use crate::packet::{Packet, PacketType};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FragmentOutcome {
    /// The fragment was added, and the message is still waiting for more fragments
    Incomplete,
    /// The fragment completed its message. This happens exactly once per message id.
    Complete(ReceivedMessage),
    /// The fragment was received before, either for a message that is still being assembled
    ///  or for one that was completed recently. Duplicates must be acknowledged again since
    ///  the first acknowledgement may have been lost.
    Duplicate,
    /// The fragment is inconsistent with fragments received earlier for the same message, or
    ///  the message would exceed the maximum message size. It is not acknowledged.
    Rejected,
}

impl FragmentOutcome {
    pub fn should_acknowledge(&self) -> bool {
        !matches!(self, FragmentOutcome::Rejected)
    }
}

struct PartialMessage {
    group_name: String,
    sender: MemberId,
    fragments: BTreeMap<u32, Bytes>,
    /// the sequence number of the MESSAGE_END fragment, once it was received
    end_seq: Option<u32>,
    size: usize,
    last_update: Instant,
}

impl PartialMessage {
    /// Sequence numbers are unique keys, and none exceeds `end_seq`, so the message is complete
    ///  if there are `end_seq + 1` fragments, regardless of the order they arrived in
    fn is_complete(&self) -> bool {
        match self.end_seq {
            Some(end_seq) => {
                let end_seq: usize = end_seq.safe_cast();
                self.fragments.len() == end_seq + 1
            }
            None => false,
        }
    }

    fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        for fragment in self.fragments.into_values() {
            buf.extend_from_slice(&fragment);
        }
        buf.freeze()
    }
}

/// Reassembles messages from their fragments, which may arrive in any order and any number of
///  times.
///
/// The ids of completed messages are remembered for the incomplete message timeout, so that
///  fragments that are retransmitted after completion (because an acknowledgement was lost) are
///  recognized as duplicates instead of starting a new message.
pub struct MessageAssembler {
    incomplete_message_timeout: Duration,
    max_message_size: usize,
    in_flight: FxHashMap<MessageId, PartialMessage>,
    completed: FxHashMap<MessageId, Instant>,
}

impl MessageAssembler {
    pub fn new(incomplete_message_timeout: Duration, max_message_size: usize) -> MessageAssembler {
        MessageAssembler {
            incomplete_message_timeout,
            max_message_size,
            in_flight: Default::default(),
            completed: Default::default(),
        }
    }

    pub fn on_fragment(&mut self, packet: &Packet, now: Instant) -> FragmentOutcome {
        debug_assert!(packet.packet_type.is_message_fragment());

        let message_id = packet.message_id;
        if self.completed.contains_key(&message_id) {
            trace!("fragment #{} of completed message {:?}", packet.sequence_number, message_id);
            return FragmentOutcome::Duplicate;
        }

        let partial = self.in_flight.entry(message_id)
            .or_insert_with(|| PartialMessage {
                group_name: packet.group_name.clone(),
                sender: packet.sender,
                fragments: Default::default(),
                end_seq: None,
                size: 0,
                last_update: now,
            });

        if partial.sender != packet.sender || partial.group_name != packet.group_name {
            warn!("fragment of message {:?} from {:?} in group {:?} does not match earlier fragments - ignoring", message_id, packet.sender, packet.group_name);
            return FragmentOutcome::Rejected;
        }
        if partial.fragments.contains_key(&packet.sequence_number) {
            trace!("duplicate fragment #{} of message {:?}", packet.sequence_number, message_id);
            return FragmentOutcome::Duplicate;
        }

        if let Some(end_seq) = partial.end_seq {
            if packet.sequence_number > end_seq || packet.packet_type == PacketType::MessageEnd {
                warn!("fragment #{} of message {:?} is inconsistent with its end at #{} - ignoring", packet.sequence_number, message_id, end_seq);
                return FragmentOutcome::Rejected;
            }
        }
        if packet.packet_type == PacketType::MessageEnd {
            if let Some((&max_seq, _)) = partial.fragments.last_key_value() {
                if max_seq > packet.sequence_number {
                    warn!("end of message {:?} at #{} precedes fragment #{} - ignoring", message_id, packet.sequence_number, max_seq);
                    return FragmentOutcome::Rejected;
                }
            }
            partial.end_seq = Some(packet.sequence_number);
        }

        partial.size += packet.payload.len();
        if partial.size > self.max_message_size {
            warn!("message {:?} from {:?} exceeds the maximum message size of {} bytes - discarding", message_id, packet.sender, self.max_message_size);
            self.in_flight.remove(&message_id);
            return FragmentOutcome::Rejected;
        }

        partial.fragments.insert(packet.sequence_number, packet.payload.clone());
        partial.last_update = now;

        if !partial.is_complete() {
            return FragmentOutcome::Incomplete;
        }

        match self.in_flight.remove(&message_id) {
            Some(partial) => {
                debug!("message {:?} from {:?} in group {:?} is complete: {} fragments", message_id, partial.sender, partial.group_name, partial.fragments.len());
                self.completed.insert(message_id, now);
                FragmentOutcome::Complete(ReceivedMessage {
                    message_id,
                    group_name: partial.group_name.clone(),
                    sender: partial.sender,
                    payload: partial.assemble(),
                })
            }
            None => FragmentOutcome::Incomplete,
        }
    }

    /// Discards messages that did not receive a fragment within the incomplete message timeout,
    ///  and forgets about messages that were completed before that
    pub fn expire_stale(&mut self, now: Instant) {
        let timeout = self.incomplete_message_timeout;

        self.in_flight.retain(|message_id, partial| {
            let keep = now.saturating_duration_since(partial.last_update) <= timeout;
            if !keep {
                warn!("discarding incomplete message {:?} from {:?} in group {:?}: {} fragments received", message_id, partial.sender, partial.group_name, partial.fragments.len());
            }
            keep
        });
        self.completed.retain(|_, completed_at| now.saturating_duration_since(*completed_at) <= timeout);
    }

    pub fn num_incomplete(&self) -> usize {
        self.in_flight.len()
    }
}
