use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative shutdown signal for the background loops: loops check [RunningFlag::is_running]
///  once per iteration, and can await [RunningFlag::stopped] alongside their regular waits so
///  that they do not sleep through a shutdown.
#[derive(Clone, Debug)]
pub struct RunningFlag {
    sender: Arc<watch::Sender<bool>>,
}

impl RunningFlag {
    pub fn new() -> RunningFlag {
        let (sender, _) = watch::channel(true);
        RunningFlag {
            sender: Arc::new(sender),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn stop(&self) {
        self.sender.send_replace(false);
    }

    /// completes once [RunningFlag::stop] was called - immediately if that happened before
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|running| !*running).await;
    }
}

impl Default for RunningFlag {
    fn default() -> Self {
        RunningFlag::new()
    }
}
