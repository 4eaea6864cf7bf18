use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::models::LifecycleManager;

/// Background task that fails operations running past their deadline.
/// Stops when dropped.
pub struct TimeoutSweeper {
    task: JoinHandle<()>,
}

impl TimeoutSweeper {
    /// Must be called from within a Tokio runtime.
    pub fn start(manager: LifecycleManager, every: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let timed_out = manager.sweep_expired();
                if !timed_out.is_empty() {
                    warn!("timed out {} operation(s)", timed_out.len());
                }
            }
        });
        debug!(interval_ms = every.as_millis() as u64, "timeout sweeper started");
        Self { task }
    }

    pub fn stop(self) {}

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}
