//! The datagram transport the group protocol runs on. All nodes of a group share one
//!  'broadcast domain', i.e. every packet sent by one node is (potentially) received by all nodes,
//!  including the sender itself. There are no delivery guarantees: packets may be dropped,
//!  duplicated or reordered.

pub mod loopback;
pub mod udp_multicast;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No packet arrived within the transport's read timeout. This is part of regular operation:
    ///  it allows a receive loop to check whether it should keep running.
    #[error("receive timed out")]
    Timeout,
    #[error("transport is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<(), TransportError>;

    async fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next packet, up to the transport's configured read timeout. Fails with
    ///  [TransportError::Timeout] if none arrives in time, and with [TransportError::Closed] if
    ///  the transport is (or becomes) closed.
    async fn receive(&self) -> Result<Bytes, TransportError>;

    /// Closing a transport unblocks a pending `receive` call
    async fn close(&self) -> Result<(), TransportError>;
}
