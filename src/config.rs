use std::time::Duration;

use anyhow::bail;

use crate::packet::Packet;

/// Settings for the group protocol. These are supplied by the host process, and all nodes sharing
///  a group are expected to use compatible values - in particular for the announce interval, since
///  remote members are evicted based on this node's idea of how often they announce themselves.
#[derive(Debug, Clone)]
pub struct GroupsConfig {
    /// Remote members are evicted if they were not heard from for longer than this. Local
    ///  members re-announce themselves in time for that, i.e. at most this long after the
    ///  previous announcement.
    pub member_announce_interval: Duration,
    /// Added to `member_announce_interval` for eviction, zero by default. Raise it for networks
    ///  with significant delay or for nodes with diverging announce intervals.
    pub member_grace_period: Duration,
    /// The announcer's wake-up period, independent of the announce interval
    pub announce_tick: Duration,

    /// A send fails if not all members acknowledged all packets within this timeout
    pub send_timeout: Duration,
    /// Unacknowledged packets are re-sent after this interval
    pub resend_interval: Duration,

    /// The maximum size of a datagram, including the packet header. This must be supported by
    ///  all network routes between nodes since the protocol relies on datagrams not being
    ///  fragmented by the network.
    pub max_packet_size: usize,
    pub max_message_size: usize,
    /// Partially received messages are discarded after this time
    pub incomplete_message_timeout: Duration,

    /// The period for checking whether this node should broadcast its net time
    pub net_time_interval: Duration,
    /// A node starts broadcasting net time if it did not receive any net time during this period
    ///  after startup...
    pub net_time_startup_grace: Duration,
    /// ... or if it did not receive any net time for this period after the last one
    pub net_time_silence_window: Duration,
}

impl GroupsConfig {
    pub fn new() -> GroupsConfig {
        GroupsConfig {
            member_announce_interval: Duration::from_secs(5),
            member_grace_period: Duration::ZERO,
            announce_tick: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
            resend_interval: Duration::from_secs(2),
            max_packet_size: 1400,
            max_message_size: 16*1024*1024,
            incomplete_message_timeout: Duration::from_secs(60),
            net_time_interval: Duration::from_secs(5),
            net_time_startup_grace: Duration::from_secs(6),
            net_time_silence_window: Duration::from_secs(20),
        }
    }

    /// The time after which a remote member that was not heard from is considered gone
    pub fn member_timeout(&self) -> Duration {
        self.member_announce_interval + self.member_grace_period
    }

    /// The number of transmission rounds before a send gives up
    pub fn num_send_rounds(&self) -> u32 {
        let rounds = self.send_timeout.as_millis() / self.resend_interval.as_millis().max(1);
        rounds.clamp(1, u32::MAX as u128) as u32
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // a group name of realistic length must leave room for payload
        if self.max_packet_size < Packet::FIXED_HEADER_LEN + 64 {
            bail!("max packet size {} is too small", self.max_packet_size);
        }
        if self.max_packet_size > 65507 {
            bail!("max packet size {} exceeds the maximum UDP payload", self.max_packet_size);
        }
        if self.resend_interval.is_zero() {
            bail!("resend interval must be positive");
        }
        if self.send_timeout < self.resend_interval {
            bail!("send timeout {:?} is shorter than the resend interval {:?}", self.send_timeout, self.resend_interval);
        }
        if self.announce_tick.is_zero() || self.net_time_interval.is_zero() {
            bail!("announce tick and net time interval must be positive");
        }
        if self.member_announce_interval.is_zero() {
            bail!("member announce interval must be positive");
        }
        Ok(())
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        GroupsConfig::new()
    }
}
