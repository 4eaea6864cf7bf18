//! Caller-side polling of operation status at a fixed interval.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{LifecycleManager, OperationId, OperationSnapshot};

#[derive(Clone)]
pub struct OperationPoller {
    manager: LifecycleManager,
    every: Duration,
}

impl OperationPoller {
    #[must_use]
    pub fn new(manager: LifecycleManager, every: Duration) -> Self {
        Self { manager, every }
    }

    /// Polls until the operation is terminal, handing every snapshot whose
    /// progress or status changed to `observe`.
    pub async fn wait_for_terminal(
        &self,
        id: OperationId,
        mut observe: impl FnMut(&OperationSnapshot),
    ) -> LifecycleResult<OperationSnapshot> {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<OperationSnapshot> = None;
        loop {
            ticker.tick().await;
            let snapshot = self.manager.get_operation(id)?;
            let changed = last.as_ref().map_or(true, |previous| {
                previous.status != snapshot.status
                    || previous.progress_percentage != snapshot.progress_percentage
            });
            if changed {
                debug!(
                    operation = %id,
                    status = ?snapshot.status,
                    progress = snapshot.progress_percentage,
                    "polled operation"
                );
                observe(&snapshot);
            }
            if snapshot.is_terminal() {
                return Ok(snapshot);
            }
            last = Some(snapshot);
        }
    }

    /// Waits for each operation in turn. Operations evicted before they were
    /// observed are skipped.
    pub async fn wait_all(
        &self,
        ids: &[OperationId],
        mut observe: impl FnMut(&OperationSnapshot),
    ) -> LifecycleResult<Vec<OperationSnapshot>> {
        let mut finished = Vec::with_capacity(ids.len());
        for id in ids {
            match self.wait_for_terminal(*id, &mut observe).await {
                Ok(snapshot) => finished.push(snapshot),
                Err(LifecycleError::OperationNotFound(_)) => {
                    debug!(operation = %id, "operation gone before it was observed");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(finished)
    }
}
