use std::fmt::{Debug, Formatter};

/// Identifies one member of a group - either a local member created by this process, or a remote
///  member learned from the network. Members are identified by a random 128 bit value rather than
///  a network address, so several members can live in the same process (and behind the same
///  socket).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(pub u128);

impl MemberId {
    pub fn random() -> MemberId {
        MemberId(rand::random())
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "M-{:032x}", self.0)
    }
}

/// Shared by all packets of a message, and used to correlate acknowledgements with the message
///  they acknowledge.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u128);

impl MessageId {
    pub fn random() -> MessageId {
        MessageId(rand::random())
    }

    /// Control packets (announcements, NET_TIME etc.) do not belong to a message
    pub const NONE: MessageId = MessageId(0);
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:032x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::zero(MemberId(0), "M-00000000000000000000000000000000")]
    #[case::small(MemberId(0xab), "M-000000000000000000000000000000ab")]
    #[case::max(MemberId(u128::MAX), "M-ffffffffffffffffffffffffffffffff")]
    fn test_member_id_debug(#[case] id: MemberId, #[case] expected: &str) {
        assert_eq!(format!("{:?}", id), expected);
    }

    #[test]
    fn test_message_id_debug() {
        assert_eq!(format!("{:?}", MessageId(0x1234)), "#00000000000000000000000000001234");
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(MemberId::random(), MemberId::random());
        assert_ne!(MessageId::random(), MessageId::random());
    }
}
