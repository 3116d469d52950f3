use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use multicast_groups::config::GroupsConfig;
use multicast_groups::groups::Groups;
use multicast_groups::ids::MemberId;
use multicast_groups::membership::member::MemberInfo;
use multicast_groups::membership::member_events::MemberEvent;
use multicast_groups::message::ReceivedMessage;
use multicast_groups::transport::udp_multicast::{UdpMulticastConfig, UdpMulticastTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{error, info, Level};

/// A minimal chat: every line read from stdin is sent to all other members of the group
#[derive(Parser)]
struct Args {
    /// the name shown to other members
    name: String,

    #[clap(long, default_value = "chat")]
    group: String,

    #[clap(long, default_value = "239.255.42.1:52001")]
    multicast_address: SocketAddrV4,

    #[clap(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut transport_config = UdpMulticastConfig::new(args.multicast_address);
    transport_config.interface = args.interface;
    let transport = UdpMulticastTransport::new(transport_config)?;

    let groups = Arc::new(Groups::new(GroupsConfig::new(), Arc::new(transport))?);
    groups.start().await?;

    // member names are learned from membership events, since message listeners can not query
    //  the (async) directory
    let names: Arc<Mutex<HashMap<MemberId, String>>> = Default::default();

    let names_for_events = names.clone();
    groups.add_member_listener(&args.group, Arc::new(move |event: &MemberEvent| {
        if event.member().is_local() {
            return;
        }
        let name = event.member().info().get("name").cloned().unwrap_or_default();
        match event {
            MemberEvent::Joined(_) => {
                println!("*** {} joined", name);
                if let Ok(mut names) = names_for_events.lock() {
                    names.insert(event.member().id(), name);
                }
            }
            MemberEvent::Left(data) => {
                println!("*** {} left ({:?})", name, data.reason);
                if let Ok(mut names) = names_for_events.lock() {
                    names.remove(&event.member().id());
                }
            }
        }
    })).await;

    groups.add_message_listener(&args.group, Arc::new(move |message: &ReceivedMessage| {
        let name = names.lock().ok()
            .and_then(|names| names.get(&message.sender).cloned())
            .unwrap_or_else(|| format!("{:?}", message.sender));
        println!("{}: {}", name, String::from_utf8_lossy(&message.payload));
    })).await;

    let mut info = MemberInfo::new();
    info.insert("name".to_string(), args.name.clone());
    let me = groups.join_group(&args.group, info).await?;
    info!("joined group {:?} as {:?}", args.group, me);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.trim().is_empty() => {
                        let groups = groups.clone();
                        let group_name = args.group.clone();
                        let num_recipients = groups.members(&group_name).await.iter().filter(|m| !m.is_local()).count();
                        // sending blocks until all members acknowledged, so it must not hold up stdin
                        tokio::spawn(async move {
                            match groups.send_message(&group_name, me, Bytes::from(line)).await {
                                Ok(_) => info!("delivered to {} members", num_recipients),
                                Err(e) => error!("{}", e),
                            }
                        });
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    groups.stop().await;
    Ok(())
}
