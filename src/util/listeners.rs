use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

/// Returned when registering a listener, and used for deregistering it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A thread safe registry of callbacks. Listeners are invoked on a snapshot of the registry, so a
///  listener can (de)register listeners without deadlocking, and registration changes take effect
///  for the next notification.
pub struct Listeners<L: ?Sized> {
    listeners: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl <L: ?Sized> Listeners<L> {
    pub fn new() -> Listeners<L> {
        Listeners {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, listener)),
            Err(_) => error!("listener registry is poisoned - listener was not registered"),
        }
        id
    }

    /// returns `true` if the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let len_before = listeners.len();
                listeners.retain(|(i, _)| *i != id);
                listeners.len() != len_before
            }
            Err(_) => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.iter()
                .map(|(_, l)| l.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read()
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl <L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Listeners::new()
    }
}
