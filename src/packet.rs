use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::{MemberId, MessageId};
use crate::util::buf::{put_string, BufError, CheckedBuf, MAX_STRING_LEN};

/// The kind of a packet, transmitted as a single byte
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    /// A fragment of a message that continues in (at least) one more packet
    MessagePart = 1,
    /// The last fragment of a message, or a message that fits into a single packet
    MessageEnd = 2,
    /// Acknowledges the packet with the same message id and sequence number on behalf of the
    ///  sending member. Has no payload.
    Acknowledgement = 3,
    /// Liveness beacon for a member. The payload contains the member's info properties.
    MemberAnnouncement = 4,
    MemberLeaving = 5,
    /// Group time broadcast, payload is the sender's net time in millis since the epoch (i64)
    NetTime = 6,
}

impl PacketType {
    pub fn is_message_fragment(&self) -> bool {
        matches!(self, PacketType::MessagePart | PacketType::MessageEnd)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PacketDecodeError {
    /// The packet does not belong to this protocol. This is expected if the multicast address is
    ///  shared with other applications, and it is not a sign of a problem in itself.
    #[error("foreign protocol id {0:08x}")]
    BadProtocolId(u32),
    #[error("truncated packet: {0}")]
    Truncated(BufError),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("group name is not valid UTF-8")]
    InvalidGroupName,
}

impl From<BufError> for PacketDecodeError {
    fn from(value: BufError) -> Self {
        match value {
            BufError::InvalidUtf8 => PacketDecodeError::InvalidGroupName,
            e @ BufError::Underflow { .. } => PacketDecodeError::Truncated(e),
        }
    }
}

/// A single datagram of the group protocol.
///
/// Wire layout, all numbers in network byte order (BE):
/// ```ascii
///  0: protocol magic (4 bytes, "MCGR")
///  4: message id (u128)
/// 20: packet sequence number (u32), 0-based within a message
/// 24: packet type (u8)
/// 25: sender member id (u128)
/// 41: group name length (u16), followed by the group name's UTF-8 bytes
///  *: payload - everything up to the end of the datagram
/// ```
///
/// There is no explicit payload length: the payload is what remains after the header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub message_id: MessageId,
    pub sequence_number: u32,
    pub packet_type: PacketType,
    pub sender: MemberId,
    pub group_name: String,
    pub payload: Bytes,
}

impl Packet {
    pub const PROTOCOL_MAGIC: [u8; 4] = *b"MCGR";

    /// header length without the group name's bytes
    pub const FIXED_HEADER_LEN: usize = 4 + 16 + 4 + 1 + 16 + 2;

    pub fn header_len(group_name: &str) -> usize {
        Self::FIXED_HEADER_LEN + group_name.len()
    }

    pub fn control(packet_type: PacketType, sender: MemberId, group_name: &str, payload: Bytes) -> Packet {
        Packet {
            message_id: MessageId::NONE,
            sequence_number: 0,
            packet_type,
            sender,
            group_name: group_name.to_string(),
            payload,
        }
    }

    /// The acknowledgement that `acking_member` sends for this packet
    pub fn ack_for(&self, acking_member: MemberId) -> Packet {
        Packet {
            message_id: self.message_id,
            sequence_number: self.sequence_number,
            packet_type: PacketType::Acknowledgement,
            sender: acking_member,
            group_name: self.group_name.clone(),
            payload: Bytes::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::header_len(&self.group_name) + self.payload.len()
    }

    /// NB: group names are validated when a group is joined, so their length fits the u16 prefix
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.group_name.len() <= MAX_STRING_LEN);

        buf.put_slice(&Self::PROTOCOL_MAGIC);
        buf.put_u128(self.message_id.0);
        buf.put_u32(self.sequence_number);
        buf.put_u8(self.packet_type.into());
        buf.put_u128(self.sender.0);
        put_string(buf, &self.group_name);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// The protocol magic is checked first so that foreign traffic can be told apart from
    ///  damaged packets
    pub fn decode(mut buf: &[u8]) -> Result<Packet, PacketDecodeError> {
        let magic = buf.checked_get_u32()?;
        if magic.to_be_bytes() != Self::PROTOCOL_MAGIC {
            return Err(PacketDecodeError::BadProtocolId(magic));
        }

        let message_id = MessageId(buf.checked_get_u128()?);
        let sequence_number = buf.checked_get_u32()?;
        let raw_packet_type = buf.checked_get_u8()?;
        let packet_type = PacketType::try_from(raw_packet_type)
            .map_err(|_| PacketDecodeError::UnknownPacketType(raw_packet_type))?;
        let sender = MemberId(buf.checked_get_u128()?);
        let group_name = buf.checked_get_string()?;
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Packet {
            message_id,
            sequence_number,
            packet_type,
            sender,
            group_name,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn header_bytes(magic: &[u8], packet_type: u8, group_name: &[u8]) -> Vec<u8> {
        let mut result = magic.to_vec();
        result.extend_from_slice(&[0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0x12]);
        result.extend_from_slice(&[0,0,0,3]);
        result.push(packet_type);
        result.extend_from_slice(&[0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0x34]);
        result.extend_from_slice(&(group_name.len() as u16).to_be_bytes());
        result.extend_from_slice(group_name);
        result
    }

    #[rstest]
    #[case::part(PacketType::MessagePart, 1)]
    #[case::end(PacketType::MessageEnd, 2)]
    #[case::ack(PacketType::Acknowledgement, 3)]
    #[case::announcement(PacketType::MemberAnnouncement, 4)]
    #[case::leaving(PacketType::MemberLeaving, 5)]
    #[case::net_time(PacketType::NetTime, 6)]
    fn test_ser(#[case] packet_type: PacketType, #[case] raw_type: u8) {
        let packet = Packet {
            message_id: MessageId(0x12),
            sequence_number: 3,
            packet_type,
            sender: MemberId(0x34),
            group_name: "grp".to_string(),
            payload: Bytes::from_static(b"xyz"),
        };

        let mut expected = header_bytes(b"MCGR", raw_type, b"grp");
        expected.extend_from_slice(b"xyz");

        let encoded = packet.encode();
        assert_eq!(encoded.as_ref(), expected.as_slice());
        assert_eq!(packet.serialized_len(), expected.len());
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[rstest]
    #[case::empty_payload(b"grp", b"")]
    #[case::empty_group_name(b"", b"abc")]
    fn test_decode(#[case] group_name: &[u8], #[case] payload: &[u8]) {
        let mut buf = header_bytes(b"MCGR", 2, group_name);
        buf.extend_from_slice(payload);

        let packet = Packet::decode(&buf).unwrap();
        assert_eq!(packet.message_id, MessageId(0x12));
        assert_eq!(packet.sequence_number, 3);
        assert_eq!(packet.packet_type, PacketType::MessageEnd);
        assert_eq!(packet.sender, MemberId(0x34));
        assert_eq!(packet.group_name.as_bytes(), group_name);
        assert_eq!(packet.payload.as_ref(), payload);
    }

    #[rstest]
    #[case::foreign(header_bytes(b"HTTP", 2, b"grp"), PacketDecodeError::BadProtocolId(0x48545450))]
    #[case::foreign_short(b"XYZW".to_vec(), PacketDecodeError::BadProtocolId(0x58595a57))]
    #[case::unknown_type(header_bytes(b"MCGR", 99, b"grp"), PacketDecodeError::UnknownPacketType(99))]
    #[case::zero_type(header_bytes(b"MCGR", 0, b"grp"), PacketDecodeError::UnknownPacketType(0))]
    #[case::bad_group_name(header_bytes(b"MCGR", 1, b"\xff\xfe"), PacketDecodeError::InvalidGroupName)]
    #[case::no_magic(b"MC".to_vec(), PacketDecodeError::Truncated(BufError::Underflow { needed: 4, available: 2 }))]
    #[case::truncated_header(b"MCGR\0\0\0".to_vec(), PacketDecodeError::Truncated(BufError::Underflow { needed: 16, available: 3 }))]
    fn test_decode_errors(#[case] buf: Vec<u8>, #[case] expected: PacketDecodeError) {
        assert_eq!(Packet::decode(&buf).unwrap_err(), expected);
    }

    #[test]
    fn test_truncated_group_name() {
        let mut buf = header_bytes(b"MCGR", 1, b"group");
        buf.truncate(buf.len() - 2);
        assert!(matches!(Packet::decode(&buf), Err(PacketDecodeError::Truncated(_))));
    }

    #[test]
    fn test_ack_for() {
        let packet = Packet {
            message_id: MessageId(7),
            sequence_number: 9,
            packet_type: PacketType::MessagePart,
            sender: MemberId(1),
            group_name: "g".to_string(),
            payload: Bytes::from_static(b"abc"),
        };

        let ack = packet.ack_for(MemberId(2));
        assert_eq!(ack.message_id, MessageId(7));
        assert_eq!(ack.sequence_number, 9);
        assert_eq!(ack.packet_type, PacketType::Acknowledgement);
        assert_eq!(ack.sender, MemberId(2));
        assert_eq!(ack.group_name, "g");
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn test_header_len() {
        assert_eq!(Packet::FIXED_HEADER_LEN, 43);
        assert_eq!(Packet::header_len("abc"), 46);
    }
}
