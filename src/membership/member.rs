use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::ids::MemberId;
use crate::net_time::Time;
use crate::util::buf::{put_string, BufError, CheckedBuf, MAX_STRING_LEN};
use crate::util::safe_converter::PrecheckedCast;

/// Free-form properties that a member carries in its announcements, e.g. a display name or the
///  address of some service it offers
pub type MemberInfo = BTreeMap<String, String>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemberKind {
    /// created by this process
    Local,
    /// learned from the network
    Remote,
}

#[derive(Debug, Clone)]
pub struct Member {
    id: MemberId,
    kind: MemberKind,
    info: MemberInfo,
    last_heard_from: Time,
    /// only used for local members, `None` until the first announcement
    last_announced_at: Option<Instant>,
}

impl Member {
    pub fn new_local(id: MemberId, info: MemberInfo, now: Time) -> Member {
        Member {
            id,
            kind: MemberKind::Local,
            info,
            last_heard_from: now,
            last_announced_at: None,
        }
    }

    pub fn new_remote(id: MemberId, info: MemberInfo, heard_at: Time) -> Member {
        Member {
            id,
            kind: MemberKind::Remote,
            info,
            last_heard_from: heard_at,
            last_announced_at: None,
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == MemberKind::Local
    }

    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    pub fn last_heard_from(&self) -> &Time {
        &self.last_heard_from
    }

    pub fn last_announced_at(&self) -> Option<Instant> {
        self.last_announced_at
    }

    /// Local members never expire
    pub fn is_expired(&self, now: &Time, timeout: Duration) -> bool {
        if self.is_local() {
            return false;
        }
        now.millis_since(&self.last_heard_from) > timeout.as_millis() as i64
    }

    /// The announcer checks once per `announce_tick`, so a member is due if waiting for the next
    ///  tick would stretch the time between announcements beyond `announce_interval`
    pub fn is_due_for_announcement(&self, now: Instant, announce_interval: Duration, announce_tick: Duration) -> bool {
        if !self.is_local() {
            return false;
        }
        match self.last_announced_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) + announce_tick >= announce_interval,
        }
    }

    pub(crate) fn heard_from(&mut self, at: Time, info: MemberInfo) {
        if at > self.last_heard_from {
            self.last_heard_from = at;
        }
        self.info = info;
    }

    pub(crate) fn mark_announced(&mut self, at: Instant) {
        self.last_announced_at = Some(at);
    }

    #[cfg(test)]
    pub(crate) fn set_last_heard_from(&mut self, at: Time) {
        self.last_heard_from = at;
    }
}

/// The number of properties and the length of each key and value must fit into a u16, and
///  the encoded info must fit into a single announcement packet. Both are checked when a local
///  member is created.
pub fn encoded_member_info_len(info: &MemberInfo) -> usize {
    2 + info.iter()
        .map(|(k, v)| 4 + k.len() + v.len())
        .sum::<usize>()
}

pub fn is_encodable_member_info(info: &MemberInfo) -> bool {
    info.len() <= u16::MAX as usize
        && info.iter().all(|(k, v)| k.len() <= MAX_STRING_LEN && v.len() <= MAX_STRING_LEN)
}

pub fn encode_member_info(info: &MemberInfo) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_member_info_len(info));
    buf.put_u16(info.len().prechecked_cast());
    for (key, value) in info {
        put_string(&mut buf, key);
        put_string(&mut buf, value);
    }
    buf.freeze()
}

/// An empty buffer is a valid (empty) set of properties
pub fn decode_member_info(mut buf: &[u8]) -> Result<MemberInfo, BufError> {
    let mut result = MemberInfo::new();
    if buf.is_empty() {
        return Ok(result);
    }

    let num_entries = buf.checked_get_u16()?;
    for _ in 0..num_entries {
        let key = buf.checked_get_string()?;
        let value = buf.checked_get_string()?;
        result.insert(key, value);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use crate::net_time::NetTime;

    fn info(entries: &[(&str, &str)]) -> MemberInfo {
        entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::empty(info(&[]))]
    #[case::single(info(&[("name", "alice")]))]
    #[case::several(info(&[("a", ""), ("b", "äöü"), ("http", "10.0.0.1:8080")]))]
    fn test_member_info_codec(#[case] info: MemberInfo) {
        let encoded = encode_member_info(&info);
        assert_eq!(encoded.len(), encoded_member_info_len(&info));
        assert_eq!(decode_member_info(&encoded).unwrap(), info);
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(decode_member_info(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode_member_info(&info(&[("name", "alice")]));
        assert!(decode_member_info(&encoded[..encoded.len()-1]).is_err());
    }

    #[test]
    fn test_is_encodable() {
        assert!(is_encodable_member_info(&info(&[("a", "b")])));
        let long_value = "x".repeat(MAX_STRING_LEN + 1);
        assert!(!is_encodable_member_info(&info(&[("a", &long_value)])));
    }

    #[rstest]
    #[case::fresh(0, false)]
    #[case::at_timeout(7_000, false)]
    #[case::after_timeout(7_001, true)]
    fn test_remote_expiry(#[case] heard_ago_millis: u64, #[case] expected: bool) {
        let net_time = NetTime::new();
        let now = net_time.current_time();
        let heard = Time::from_local(net_time.clone(), now.local_time_value() - heard_ago_millis as i64);

        let member = Member::new_remote(MemberId(1), MemberInfo::new(), heard);
        assert_eq!(member.is_expired(&now, Duration::from_secs(7)), expected);
    }

    #[test]
    fn test_local_never_expires() {
        let net_time = NetTime::new();
        let member = Member::new_local(MemberId(1), MemberInfo::new(), net_time.time_ago(Duration::from_secs(3600)));
        assert!(!member.is_expired(&net_time.current_time(), Duration::from_secs(7)));
    }

    #[rstest]
    #[case::tick_too_early(2, false)]
    #[case::next_tick_too_late(3, true)]
    #[case::interval_elapsed(5, true)]
    fn test_due_for_announcement(#[case] since_last_secs: u64, #[case] expected: bool) {
        let net_time = NetTime::new();
        let interval = Duration::from_secs(5);
        let tick = Duration::from_secs(2);
        let now = Instant::now();

        let mut member = Member::new_local(MemberId(1), MemberInfo::new(), net_time.current_time());
        assert!(member.is_due_for_announcement(now, interval, tick));

        member.mark_announced(now);
        assert_eq!(member.is_due_for_announcement(now + Duration::from_secs(since_last_secs), interval, tick), expected);

        let remote = Member::new_remote(MemberId(2), MemberInfo::new(), net_time.current_time());
        assert!(!remote.is_due_for_announcement(now, interval, tick));
    }

    #[test]
    fn test_heard_from_keeps_latest_time() {
        let net_time = NetTime::new();
        let now = net_time.current_time();
        let mut member = Member::new_remote(MemberId(1), info(&[("v", "1")]), now.clone());

        member.heard_from(net_time.time_ago(Duration::from_secs(10)), info(&[("v", "2")]));
        assert_eq!(member.last_heard_from(), &now);
        assert_eq!(member.info(), &info(&[("v", "2")]));
    }
}
