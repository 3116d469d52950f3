use crate::membership::member::Member;

#[derive(Clone, Debug)]
pub enum MemberEvent {
    /// A member became known, either a local member joining or a remote member's first
    ///  announcement
    Joined(MemberJoinedData),
    /// A member left the group gracefully, or a remote member was evicted because it was not
    ///  heard from for too long
    Left(MemberLeftData),
}

impl MemberEvent {
    pub fn group_name(&self) -> &str {
        match self {
            MemberEvent::Joined(d) => &d.group_name,
            MemberEvent::Left(d) => &d.group_name,
        }
    }

    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Joined(d) => &d.member,
            MemberEvent::Left(d) => &d.member,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemberJoinedData {
    pub group_name: String,
    pub member: Member,
}

#[derive(Clone, Debug)]
pub struct MemberLeftData {
    pub group_name: String,
    pub member: Member,
    pub reason: LeaveReason,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaveReason {
    /// a local member left, or a remote member sent a leave notice
    Left,
    Evicted,
}

/// Listeners are called synchronously by whatever task changes the membership, so they should
///  return quickly and must not block.
pub trait MemberListener: Send + Sync + 'static {
    fn on_member_event(&self, event: &MemberEvent);
}

impl <F: Fn(&MemberEvent) + Send + Sync + 'static> MemberListener for F {
    fn on_member_event(&self, event: &MemberEvent) {
        self(event)
    }
}
