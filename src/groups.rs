use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::GroupsConfig;
use crate::dispatcher::{run_receive_loop, MessageDispatcher};
use crate::ids::{MemberId, MessageId};
use crate::membership::announcer::{announce_leaving, announcement_packet, run_announcer_loop};
use crate::membership::directory::MembershipDirectory;
use crate::membership::member::{encoded_member_info_len, is_encodable_member_info, Member, MemberInfo};
use crate::membership::member_events::MemberListener;
use crate::message::sender::{ReliableSender, SendError};
use crate::message::MessageListener;
use crate::net_time::net_time_loop::run_net_time_loop;
use crate::net_time::NetTime;
use crate::packet::Packet;
use crate::transport::Transport;
use crate::util::buf::MAX_STRING_LEN;
use crate::util::listeners::ListenerId;
use crate::util::running_flag::RunningFlag;

struct RunningTasks {
    running: RunningFlag,
    handles: Vec<JoinHandle<()>>,
}

/// The entry point for applications: owns the membership directory, the net clock and the
///  background loops for one transport.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use bytes::Bytes;
/// # use multicast_groups::config::GroupsConfig;
/// # use multicast_groups::groups::Groups;
/// # use multicast_groups::transport::udp_multicast::{UdpMulticastConfig, UdpMulticastTransport};
/// # async fn demo() -> anyhow::Result<()> {
/// let transport = UdpMulticastTransport::new(UdpMulticastConfig::new("239.255.42.1:52001".parse()?))?;
/// let groups = Groups::new(GroupsConfig::new(), Arc::new(transport))?;
/// groups.start().await?;
///
/// let me = groups.join_group("chat", Default::default()).await?;
/// groups.send_message("chat", me, Bytes::from_static(b"hello")).await?;
///
/// groups.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Groups {
    config: Arc<GroupsConfig>,
    node_id: MemberId,
    transport: Arc<dyn Transport>,
    directory: Arc<MembershipDirectory>,
    sender: Arc<ReliableSender>,
    dispatcher: Arc<MessageDispatcher>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl Groups {
    pub fn new(config: GroupsConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Groups> {
        config.validate()?;
        let config = Arc::new(config);

        let node_id = MemberId::random();
        // a leaving member's retransmissions may arrive until its send times out
        let directory = Arc::new(MembershipDirectory::new(NetTime::new(), config.member_timeout())
            .with_departed_retention(config.member_timeout().max(config.send_timeout)));
        let sender = Arc::new(ReliableSender::new(config.clone(), transport.clone()));
        let dispatcher = Arc::new(MessageDispatcher::new(&config, node_id, directory.clone(), sender.clone(), transport.clone()));

        Ok(Groups {
            config,
            node_id,
            transport,
            directory,
            sender,
            dispatcher,
            tasks: Mutex::new(None),
        })
    }

    /// Opens the transport and spawns the receive, announcer and net time loops
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            bail!("already started");
        }

        self.transport.open().await?;
        info!("starting group node {:?}", self.node_id);

        let running = RunningFlag::new();
        let handles = vec![
            tokio::spawn(run_receive_loop(self.dispatcher.clone(), self.transport.clone(), running.clone())),
            tokio::spawn(run_announcer_loop(self.config.clone(), self.directory.clone(), self.transport.clone(), running.clone())),
            tokio::spawn(run_net_time_loop(self.config.clone(), self.node_id, self.directory.net_time().clone(), self.transport.clone(), running.clone())),
        ];

        *tasks = Some(RunningTasks { running, handles });
        Ok(())
    }

    /// Sends leave notices for all local members, stops the background loops and closes the
    ///  transport. Local members are removed, remote members are kept.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        info!("stopping group node {:?}", self.node_id);

        for group in self.directory.groups().await {
            for member_id in group.local_member_ids().await {
                announce_leaving(group.name(), member_id, self.transport.as_ref()).await;
                self.directory.remove_local_member(&group, member_id).await;
            }
        }

        tasks.running.stop();
        if let Err(e) = self.transport.close().await {
            error!("error closing transport: {}", e);
        }
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                error!("background task failed: {}", e);
            }
        }
        info!("group node {:?} stopped", self.node_id);
    }

    /// Adds a new local member to a group, creating the group if necessary. The member is
    ///  announced right away, and re-announced periodically afterwards.
    pub async fn join_group(&self, group_name: &str, info: MemberInfo) -> anyhow::Result<MemberId> {
        if group_name.len() > MAX_STRING_LEN {
            bail!("group name is too long: {} bytes", group_name.len());
        }
        if !is_encodable_member_info(&info) {
            bail!("member info has too many entries, or an entry that is too long");
        }
        let announcement_len = Packet::header_len(group_name) + encoded_member_info_len(&info);
        if announcement_len > self.config.max_packet_size {
            bail!("group name and member info require {} bytes, exceeding the max packet size of {}", announcement_len, self.config.max_packet_size);
        }

        let group = self.directory.get_or_create_group(group_name).await;
        let member = Member::new_local(MemberId::random(), info, self.directory.net_time().current_time());
        let member_id = member.id();
        group.add_member(member.clone()).await;

        match self.transport.send(&announcement_packet(group_name, &member).encode()).await {
            Ok(()) => group.mark_announced(member_id, Instant::now()).await,
            Err(e) => error!("error announcing new member {:?} in group {:?} - retrying later: {}", member_id, group_name, e),
        }
        Ok(member_id)
    }

    pub async fn leave_group(&self, group_name: &str, member_id: MemberId) -> anyhow::Result<()> {
        let group = match self.directory.get_group(group_name).await {
            Some(group) if group.is_local_member(member_id).await => group,
            _ => bail!("{:?} is not a local member of group {:?}", member_id, group_name),
        };

        self.directory.remove_local_member(&group, member_id).await;
        announce_leaving(group_name, member_id, self.transport.as_ref()).await;
        Ok(())
    }

    /// Sends a message on behalf of a local member, returning when all of the group's remote
    ///  members acknowledged it.
    pub async fn send_message(&self, group_name: &str, sender: MemberId, payload: Bytes) -> Result<MessageId, SendError> {
        let Some(group) = self.directory.get_group(group_name).await else {
            return Err(SendError::NotALocalMember { member: sender, group_name: group_name.to_string() });
        };
        self.sender.send(&group, sender, payload).await
    }

    pub async fn members(&self, group_name: &str) -> Vec<Member> {
        match self.directory.get_group(group_name).await {
            Some(group) => group.members().await,
            None => Vec::new(),
        }
    }

    pub async fn add_member_listener(&self, group_name: &str, listener: Arc<dyn MemberListener>) -> ListenerId {
        self.directory.get_or_create_group(group_name).await
            .add_member_listener(listener)
    }

    pub async fn remove_member_listener(&self, group_name: &str, id: ListenerId) -> bool {
        match self.directory.get_group(group_name).await {
            Some(group) => group.remove_member_listener(id),
            None => false,
        }
    }

    pub async fn add_message_listener(&self, group_name: &str, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.directory.get_or_create_group(group_name).await
            .add_message_listener(listener)
    }

    pub async fn remove_message_listener(&self, group_name: &str, id: ListenerId) -> bool {
        match self.directory.get_group(group_name).await {
            Some(group) => group.remove_message_listener(id),
            None => false,
        }
    }

    pub fn node_id(&self) -> MemberId {
        self.node_id
    }

    pub fn config(&self) -> &GroupsConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.directory
    }

    pub fn net_time(&self) -> &Arc<NetTime> {
        self.directory.net_time()
    }
}
