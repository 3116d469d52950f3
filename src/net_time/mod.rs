//! Net time is a group-wide approximation of a shared clock: one node broadcasts its time, and
//!  all other nodes store the difference between that time and their local wall clock. The
//!  difference is applied whenever a time value is read, so time values that were created before
//!  an update shift along with it.
//!
//! The last received time wins, and there is no round trip compensation, so precision is in the
//!  order of network latency.

pub mod net_time_loop;

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, error};

/// local wall clock time in millis since the epoch
pub fn local_millis_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => {
            error!("system clock is before the UNIX epoch: {}", e);
            -(e.duration().as_millis() as i64)
        }
    }
}

#[derive(Debug, Default)]
pub struct NetTime {
    time_diff_millis: AtomicI64,
    last_remote_update: Mutex<Option<Instant>>,
}

impl NetTime {
    pub fn new() -> Arc<NetTime> {
        Arc::new(NetTime::default())
    }

    /// The difference between net time and local time, in millis
    pub fn time_diff(&self) -> i64 {
        self.time_diff_millis.load(AtomicOrdering::Acquire)
    }

    /// Adopt a time value received from the network, overwriting any previous difference
    pub fn update_from_remote(&self, remote_net_time_millis: i64) {
        let diff = remote_net_time_millis - local_millis_now();
        let prev = self.time_diff_millis.swap(diff, AtomicOrdering::AcqRel);
        if prev != diff {
            debug!("net time difference changed from {}ms to {}ms", prev, diff);
        }

        if let Ok(mut last) = self.last_remote_update.lock() {
            *last = Some(Instant::now());
        }
    }

    /// The (monotonic) point in time when net time was last received from the network
    pub fn last_remote_update(&self) -> Option<Instant> {
        match self.last_remote_update.lock() {
            Ok(last) => *last,
            Err(_) => None,
        }
    }

    pub fn net_time_millis_now(&self) -> i64 {
        local_millis_now() + self.time_diff()
    }

    pub fn current_time(self: &Arc<Self>) -> Time {
        Time::from_local(self.clone(), local_millis_now())
    }

    /// A time value that is `ago` in the past, useful for back-dating
    pub fn time_ago(self: &Arc<Self>, ago: Duration) -> Time {
        Time::from_local(self.clone(), local_millis_now() - ago.as_millis() as i64)
    }
}

/// A point in time, stored as local time and converted to net time whenever it is read.
///
/// Comparisons use the local time only, which is equivalent to comparing net times since all
///  time values refer to the same [NetTime].
#[derive(Clone)]
pub struct Time {
    local_millis: i64,
    net_time: Arc<NetTime>,
}

impl Time {
    pub fn from_local(net_time: Arc<NetTime>, local_millis: i64) -> Time {
        Time { local_millis, net_time }
    }

    pub fn from_net(net_time: Arc<NetTime>, net_millis: i64) -> Time {
        let local_millis = net_millis - net_time.time_diff();
        Time { local_millis, net_time }
    }

    pub fn local_time_value(&self) -> i64 {
        self.local_millis
    }

    pub fn net_time_value(&self) -> i64 {
        self.local_millis + self.net_time.time_diff()
    }

    /// The time from `earlier` to `self` in millis, negative if `earlier` is actually later
    pub fn millis_since(&self, earlier: &Time) -> i64 {
        self.net_time_value() - earlier.net_time_value()
    }
}

impl Debug for Time {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Time{{local:{}, net:{}}}", self.local_millis, self.net_time_value())
    }
}

impl PartialEq for Time {
    fn eq(&self, other: &Self) -> bool {
        self.local_millis == other.local_millis
    }
}
impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.local_millis.cmp(&other.local_millis)
    }
}
