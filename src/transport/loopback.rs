use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{trace, warn};

use crate::transport::{Transport, TransportError};

type DropFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// An in-process 'multicast network': every packet sent by one of its transports is delivered
///  to all open transports, including the sender. A drop filter can be installed to simulate
///  packet loss.
///
/// This is useful for testing, and for running several group nodes inside a single process.
pub struct LoopbackNetwork {
    sender: broadcast::Sender<Bytes>,
    drop_filter: RwLock<Option<DropFilter>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        let (sender, _) = broadcast::channel(4096);
        Arc::new(LoopbackNetwork {
            sender,
            drop_filter: RwLock::new(None),
        })
    }

    pub fn new_transport(self: &Arc<Self>, read_timeout: Duration) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            read_timeout,
            receiver: Mutex::new(None),
            is_closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Packets for which the filter returns `true` are dropped for all receivers
    pub fn set_drop_filter(&self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        if let Ok(mut f) = self.drop_filter.write() {
            *f = Some(Arc::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut f) = self.drop_filter.write() {
            *f = None;
        }
    }

    fn should_drop(&self, packet: &[u8]) -> bool {
        let filter = match self.drop_filter.read() {
            Ok(f) => f.clone(),
            Err(_) => None,
        };
        filter.map(|f| f(packet)).unwrap_or(false)
    }

    fn publish(&self, packet: &[u8]) {
        if self.should_drop(packet) {
            trace!("loopback network: dropping packet");
            return;
        }
        // an error only means that there is currently no open transport
        let _ = self.sender.send(Bytes::copy_from_slice(packet));
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    read_timeout: Duration,
    receiver: Mutex<Option<broadcast::Receiver<Bytes>>>,
    is_closed: AtomicBool,
    close_signal: Notify,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let mut receiver = self.receiver.lock().await;
        if receiver.is_none() {
            *receiver = Some(self.network.sender.subscribe());
        }
        self.is_closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.network.publish(packet);
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut lock = self.receiver.lock().await;
        let receiver = match lock.as_mut() {
            Some(r) => r,
            None => return Err(TransportError::Closed),
        };

        let deadline = tokio::time::Instant::now() + self.read_timeout;
        loop {
            select! {
                result = tokio::time::timeout_at(deadline, receiver.recv()) => {
                    match result {
                        Err(_) => return Err(TransportError::Timeout),
                        Ok(Ok(packet)) => return Ok(packet),
                        Ok(Err(RecvError::Lagged(num_lost))) => {
                            warn!("loopback receiver lagging behind: {} packets lost", num_lost);
                        }
                        Ok(Err(RecvError::Closed)) => return Err(TransportError::Closed),
                    }
                }
                _ = self.close_signal.notified() => {
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.is_closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }
}
