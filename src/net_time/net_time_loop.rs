use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::{self, Instant};
use tokio::select;
use tracing::{debug, error, info};

use crate::config::GroupsConfig;
use crate::ids::MemberId;
use crate::net_time::NetTime;
use crate::packet::{Packet, PacketType};
use crate::transport::Transport;
use crate::util::running_flag::RunningFlag;

/// Periodically decides whether this node should act as the group's time source, and broadcasts
///  its net time if so.
///
/// There is no election: a node becomes a time source if it does not hear any other time source,
///  either during a grace period after startup or for a while after the last received time. If
///  several nodes broadcast, each of them falls silent on hearing another one, and the last one
///  heard wins.
pub async fn run_net_time_loop(
    config: Arc<GroupsConfig>,
    node_id: MemberId,
    net_time: Arc<NetTime>,
    transport: Arc<dyn Transport>,
    running: RunningFlag,
) {
    info!("starting net time loop");

    let started = Instant::now();
    let mut ticks = time::interval(config.net_time_interval);

    while running.is_running() {
        select! {
            _ = ticks.tick() => {}
            _ = running.stopped() => break,
        }

        if should_broadcast(&config, started, net_time.last_remote_update(), Instant::now()) {
            broadcast_net_time(node_id, net_time.as_ref(), transport.as_ref()).await;
        }
    }

    info!("net time loop terminated");
}

pub fn should_broadcast(config: &GroupsConfig, started: Instant, last_remote_update: Option<Instant>, now: Instant) -> bool {
    match last_remote_update {
        None => now.saturating_duration_since(started) >= config.net_time_startup_grace,
        Some(last) => now.saturating_duration_since(last) > config.net_time_silence_window,
    }
}

pub fn net_time_packet(node_id: MemberId, net_time_millis: i64) -> Packet {
    let mut payload = BytesMut::with_capacity(std::mem::size_of::<i64>());
    payload.put_i64(net_time_millis);
    Packet::control(PacketType::NetTime, node_id, "", payload.freeze())
}

async fn broadcast_net_time(node_id: MemberId, net_time: &NetTime, transport: &dyn Transport) {
    let packet = net_time_packet(node_id, net_time.net_time_millis_now());
    debug!("broadcasting net time");
    if let Err(e) = transport.send(&packet.encode()).await {
        error!("error sending net time: {}", e);
    }
}

/// Parses the payload of a NET_TIME packet
pub fn parse_net_time_payload(payload: &Bytes) -> Option<i64> {
    let raw: [u8; 8] = payload.as_ref().try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}
