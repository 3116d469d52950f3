//! Fragmentation, reassembly and acknowledged sending of messages

pub mod assembler;
pub mod sender;

use bytes::Bytes;

use crate::ids::{MemberId, MessageId};

/// A fully reassembled message as it is passed to [MessageListener]s
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub group_name: String,
    pub sender: MemberId,
    pub payload: Bytes,
}

/// Called exactly once per message that was completely received in a group with a local member.
///  Listeners are called from the receive loop, so they must return quickly.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, message: &ReceivedMessage);
}

impl <F: Fn(&ReceivedMessage) + Send + Sync + 'static> MessageListener for F {
    fn on_message(&self, message: &ReceivedMessage) {
        self(message)
    }
}
