//! Group membership: which members (local and remote) belong to which group, liveness
//!  announcements for local members, and eviction of remote members that went silent.

pub mod announcer;
pub mod directory;
pub mod member;
pub mod member_events;
