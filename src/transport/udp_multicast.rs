use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, trace};

use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct UdpMulticastConfig {
    /// All nodes of a group must use the same multicast address and port
    pub multicast_addr: SocketAddrV4,
    /// The local interface to join the multicast group on, `UNSPECIFIED` to let the OS decide
    pub interface: Ipv4Addr,
    pub read_timeout: Duration,
    pub ttl: u32,
    /// This must be at least the group protocol's max packet size
    pub receive_buffer_size: usize,
}

impl UdpMulticastConfig {
    pub fn new(multicast_addr: SocketAddrV4) -> UdpMulticastConfig {
        UdpMulticastConfig {
            multicast_addr,
            interface: Ipv4Addr::UNSPECIFIED,
            read_timeout: Duration::from_secs(1),
            ttl: 1,
            receive_buffer_size: 65536,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multicast_addr.ip().is_multicast() {
            bail!("{} is not a multicast address", self.multicast_addr.ip());
        }
        if self.read_timeout.is_zero() {
            bail!("read timeout must be positive");
        }
        Ok(())
    }
}

/// A [Transport] based on IP V4 multicast: all nodes join the same multicast group, and every
///  packet is sent to that group. Multicast loopback is enabled so that several nodes on the same
///  host (or in the same process) see each other.
pub struct UdpMulticastTransport {
    config: UdpMulticastConfig,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    receive_buffer: Mutex<BytesMut>,
    close_signal: Notify,
}

impl UdpMulticastTransport {
    pub fn new(config: UdpMulticastConfig) -> anyhow::Result<UdpMulticastTransport> {
        config.validate()?;
        Ok(UdpMulticastTransport {
            config,
            socket: Default::default(),
            receive_buffer: Mutex::new(BytesMut::new()),
            close_signal: Notify::new(),
        })
    }

    fn create_socket(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // several nodes on the same host must be able to listen on the same port
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.multicast_addr.port());
        socket.bind(&SockAddr::from(bind_addr))?;

        socket.join_multicast_v4(self.config.multicast_addr.ip(), &self.config.interface)?;
        socket.set_multicast_if_v4(&self.config.interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(self.config.ttl)?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }

    /// Received packets are split off the receive buffer. Once the previous packet is dropped,
    ///  its memory is reclaimed here instead of allocating a new buffer.
    fn reserve_receive_buffer(buf: &mut BytesMut, size: usize) {
        buf.clear();
        buf.reserve(size);
    }

    async fn current_socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket.read().await
            .clone()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for UdpMulticastTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let mut socket = self.socket.write().await;
        if socket.is_some() {
            debug!("multicast transport is already open");
            return Ok(());
        }

        *socket = Some(Arc::new(self.create_socket()?));
        info!("joined multicast group {:?}", self.config.multicast_addr);
        Ok(())
    }

    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        let socket = self.current_socket().await?;
        trace!("sending {} bytes to {:?}", packet.len(), self.config.multicast_addr);
        socket.send_to(packet, self.config.multicast_addr).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        let socket = self.current_socket().await?;
        let mut buf = self.receive_buffer.lock().await;
        Self::reserve_receive_buffer(&mut buf, self.config.receive_buffer_size);

        select! {
            result = tokio::time::timeout(self.config.read_timeout, socket.recv_buf_from(&mut *buf)) => {
                match result {
                    Err(_) => Err(TransportError::Timeout),
                    Ok(Err(e)) => Err(e.into()),
                    Ok(Ok((num_read, from))) => {
                        trace!("received {} bytes from {:?}", num_read, from);
                        Ok(buf.split().freeze())
                    }
                }
            }
            _ = self.close_signal.notified() => {
                Err(TransportError::Closed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let prev = self.socket.write().await.take();
        self.close_signal.notify_waiters();

        if let Some(socket) = prev {
            // NB: a pending receive may still hold a reference to the socket, so it is not
            //  necessarily dropped here
            if let Err(e) = socket2::SockRef::from(socket.as_ref())
                .leave_multicast_v4(self.config.multicast_addr.ip(), &self.config.interface)
            {
                debug!("error leaving multicast group: {}", e);
            }
            info!("left multicast group {:?}", self.config.multicast_addr);
        }
        Ok(())
    }
}
