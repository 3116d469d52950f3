use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::ids::MemberId;
use crate::membership::member::{Member, MemberInfo};
use crate::membership::member_events::{LeaveReason, MemberEvent, MemberJoinedData, MemberLeftData, MemberListener};
use crate::message::{MessageListener, ReceivedMessage};
use crate::net_time::{NetTime, Time};
use crate::util::listeners::{ListenerId, Listeners};

/// A named group with its known members, local and remote.
///
/// Listeners are notified after the member map's lock is released, on the task that made the
///  change. They see changes in the order they were made for a given member, but a listener
///  querying the group may already see a later state.
pub struct Group {
    name: String,
    members: RwLock<FxHashMap<MemberId, Member>>,
    member_removed: Notify,
    member_listeners: Listeners<dyn MemberListener>,
    message_listeners: Listeners<dyn MessageListener>,
}

impl Group {
    pub fn new(name: &str) -> Group {
        Group {
            name: name.to_string(),
            members: Default::default(),
            member_removed: Notify::new(),
            member_listeners: Listeners::new(),
            message_listeners: Listeners::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// returns `false` and leaves the group unchanged if there is already a member with the
    ///  same id
    pub async fn add_member(&self, member: Member) -> bool {
        {
            let mut members = self.members.write().await;
            if members.contains_key(&member.id()) {
                return false;
            }
            members.insert(member.id(), member.clone());
        }

        info!("member {:?} joined group {:?}", member.id(), self.name);
        self.notify_member_event(MemberEvent::Joined(MemberJoinedData {
            group_name: self.name.clone(),
            member,
        }));
        true
    }

    pub async fn remove_member(&self, id: MemberId, reason: LeaveReason) -> Option<Member> {
        let removed = self.members.write().await.remove(&id)?;
        self.member_removed.notify_waiters();

        info!("member {:?} left group {:?} ({:?})", id, self.name, reason);
        self.notify_member_event(MemberEvent::Left(MemberLeftData {
            group_name: self.name.clone(),
            member: removed.clone(),
            reason,
        }));
        Some(removed)
    }

    pub async fn has_member(&self, id: MemberId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn member(&self, id: MemberId) -> Option<Member> {
        self.members.read().await.get(&id).cloned()
    }

    /// a snapshot of the current members that is not affected by subsequent changes
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn num_members(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_local_member(&self, id: MemberId) -> bool {
        self.members.read().await
            .get(&id)
            .map(|m| m.is_local())
            .unwrap_or(false)
    }

    pub async fn local_member_ids(&self) -> Vec<MemberId> {
        self.members.read().await
            .values()
            .filter(|m| m.is_local())
            .map(|m| m.id())
            .collect()
    }

    pub async fn remote_member_ids(&self) -> FxHashSet<MemberId> {
        self.members.read().await
            .values()
            .filter(|m| !m.is_local())
            .map(|m| m.id())
            .collect()
    }

    /// Registers a remote member on its first announcement, and refreshes its liveness and info
    ///  on subsequent ones. Announcements for a local member's id are ignored.
    pub async fn on_announcement(&self, id: MemberId, info: MemberInfo, heard_at: Time) {
        let joined = {
            let mut members = self.members.write().await;
            match members.get_mut(&id) {
                Some(member) if member.is_local() => {
                    debug!("ignoring announcement for local member {:?} in group {:?}", id, self.name);
                    None
                }
                Some(member) => {
                    trace!("refreshing member {:?} in group {:?}", id, self.name);
                    member.heard_from(heard_at, info);
                    None
                }
                None => {
                    let member = Member::new_remote(id, info, heard_at);
                    members.insert(id, member.clone());
                    Some(member)
                }
            }
        };

        if let Some(member) = joined {
            info!("remote member {:?} joined group {:?}", id, self.name);
            self.notify_member_event(MemberEvent::Joined(MemberJoinedData {
                group_name: self.name.clone(),
                member,
            }));
        }
    }

    /// Removes all remote members that were not heard from for longer than `timeout`, and
    ///  returns them
    pub async fn evict_expired_members(&self, now: &Time, timeout: Duration) -> Vec<Member> {
        let evicted = {
            let mut members = self.members.write().await;
            let expired_ids = members.values()
                .filter(|m| m.is_expired(now, timeout))
                .map(|m| m.id())
                .collect::<Vec<_>>();

            expired_ids.into_iter()
                .flat_map(|id| members.remove(&id))
                .collect::<Vec<_>>()
        };

        if !evicted.is_empty() {
            self.member_removed.notify_waiters();
        }
        for member in &evicted {
            info!("evicting member {:?} from group {:?}: last heard from {:?}", member.id(), self.name, member.last_heard_from());
            self.notify_member_event(MemberEvent::Left(MemberLeftData {
                group_name: self.name.clone(),
                member: member.clone(),
                reason: LeaveReason::Evicted,
            }));
        }
        evicted
    }

    /// Completes on the next removal of a member (leaving or evicted) after this call. This
    ///  allows waiting for a member's acknowledgement to be aborted when the member goes away.
    pub fn member_removed(&self) -> Notified<'_> {
        self.member_removed.notified()
    }

    pub async fn local_members_due_for_announcement(&self, now: Instant, announce_interval: Duration, announce_tick: Duration) -> Vec<Member> {
        self.members.read().await
            .values()
            .filter(|m| m.is_due_for_announcement(now, announce_interval, announce_tick))
            .cloned()
            .collect()
    }

    pub async fn mark_announced(&self, id: MemberId, at: Instant) {
        if let Some(member) = self.members.write().await.get_mut(&id) {
            member.mark_announced(at);
        }
    }

    pub fn add_member_listener(&self, listener: Arc<dyn MemberListener>) -> ListenerId {
        self.member_listeners.add(listener)
    }

    pub fn remove_member_listener(&self, id: ListenerId) -> bool {
        self.member_listeners.remove(id)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.message_listeners.add(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.message_listeners.remove(id)
    }

    pub(crate) fn notify_message(&self, message: &ReceivedMessage) {
        for listener in self.message_listeners.snapshot() {
            listener.on_message(message);
        }
    }

    fn notify_member_event(&self, event: MemberEvent) {
        trace!("event: {:?}", event);
        for listener in self.member_listeners.snapshot() {
            listener.on_member_event(&event);
        }
    }
}

/// The registry of all groups this process knows about. Groups are created on first reference,
///  either by joining them locally or by receiving traffic for them, and live until they are
///  explicitly removed.
///
/// Local members that left are remembered for a while: packets they sent before leaving may
///  still be looped back, and must not be mistaken for a remote member's.
pub struct MembershipDirectory {
    net_time: Arc<NetTime>,
    member_timeout: Duration,
    departed_retention: Duration,
    groups: RwLock<FxHashMap<String, Arc<Group>>>,
    departed_local_members: Mutex<FxHashMap<MemberId, Instant>>,
}

impl MembershipDirectory {
    pub fn new(net_time: Arc<NetTime>, member_timeout: Duration) -> MembershipDirectory {
        MembershipDirectory {
            net_time,
            member_timeout,
            departed_retention: member_timeout,
            groups: Default::default(),
            departed_local_members: Default::default(),
        }
    }

    /// How long departed local members are remembered, the member timeout by default
    pub fn with_departed_retention(mut self, departed_retention: Duration) -> MembershipDirectory {
        self.departed_retention = departed_retention;
        self
    }

    pub fn net_time(&self) -> &Arc<NetTime> {
        &self.net_time
    }

    pub async fn get_or_create_group(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self.groups.read().await.get(name) {
            return group.clone();
        }

        self.groups.write().await
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("creating group {:?}", name);
                Arc::new(Group::new(name))
            })
            .clone()
    }

    pub async fn get_group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn remove_group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.write().await.remove(name)
    }

    /// Removes a local member from a group, remembering its id as a departed local member
    pub async fn remove_local_member(&self, group: &Group, id: MemberId) -> Option<Member> {
        if !group.is_local_member(id).await {
            return None;
        }
        match self.departed_local_members.lock() {
            Ok(mut departed) => {
                departed.insert(id, Instant::now());
            }
            Err(_) => error!("departed member registry is poisoned - {:?} is not remembered", id),
        }
        group.remove_member(id, LeaveReason::Left).await
    }

    /// `true` if `id` belonged to a local member that left recently
    pub fn is_departed_local_member(&self, id: MemberId) -> bool {
        let Ok(mut departed) = self.departed_local_members.lock() else {
            return false;
        };
        let now = Instant::now();
        let retention = self.departed_retention;
        departed.retain(|_, left_at| now.saturating_duration_since(*left_at) <= retention);
        departed.contains_key(&id)
    }

    /// Evicts the remote members of a group that were not heard from within the member timeout,
    ///  measured in net time
    pub async fn evict_expired_members(&self, group: &Group) -> Vec<Member> {
        group.evict_expired_members(&self.net_time.current_time(), self.member_timeout).await
    }
}
