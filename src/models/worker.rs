use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::operations::{OperationId, OperationKind};
use super::resource::{Footprint, ResourceId};

/// Everything a worker needs to carry out one load or unload.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    pub operation_id: OperationId,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub declared_size_bytes: u64,
    pub estimated: Footprint,
    pub location: Option<String>,
    cancelled: Arc<AtomicBool>,
}

impl WorkPlan {
    pub(crate) fn new(
        operation_id: OperationId,
        resource_id: ResourceId,
        kind: OperationKind,
        declared_size_bytes: u64,
        estimated: Footprint,
        location: Option<String>,
    ) -> Self {
        Self {
            operation_id,
            resource_id,
            kind,
            declared_size_bytes,
            estimated,
            location,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the operation was cancelled or timed out; the result of the
    /// work is discarded either way, so workers should stop early.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    /// The resource is left in an unknown state and needs an operator reset.
    pub fatal: bool,
}

impl WorkerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// The external engine that actually moves model weights in and out of memory.
///
/// Calls are blocking and run on a dedicated blocking thread. `progress`
/// takes a percentage in `0.0..=100.0`.
pub trait ModelWorker: Send + Sync + 'static {
    /// Returns the measured footprint of the loaded resource.
    fn load(&self, plan: &WorkPlan, progress: &mut dyn FnMut(f32))
        -> Result<Footprint, WorkerError>;

    fn unload(&self, plan: &WorkPlan, progress: &mut dyn FnMut(f32)) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatedWorkerConfig {
    pub bytes_per_sec: u64,
    pub steps: u32,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

impl Default for SimulatedWorkerConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: 2 * 1024 * 1024 * 1024,
            steps: 10,
            min_duration: Duration::from_millis(200),
            max_duration: Duration::from_secs(20),
        }
    }
}

/// Stand-in worker that takes time proportional to the declared size and
/// reports the estimate as the measured footprint.
#[derive(Debug, Clone, Default)]
pub struct SimulatedWorker {
    config: SimulatedWorkerConfig,
}

impl SimulatedWorker {
    #[must_use]
    pub fn new(config: SimulatedWorkerConfig) -> Self {
        Self { config }
    }

    fn duration_for(&self, plan: &WorkPlan) -> Duration {
        let secs = plan.declared_size_bytes as f64 / self.config.bytes_per_sec.max(1) as f64;
        Duration::from_secs_f64(secs).clamp(self.config.min_duration, self.config.max_duration)
    }

    fn run_steps(
        &self,
        plan: &WorkPlan,
        total: Duration,
        progress: &mut dyn FnMut(f32),
    ) -> Result<(), WorkerError> {
        let steps = self.config.steps.max(1);
        let tick = total / steps;
        for step in 1..=steps {
            std::thread::sleep(tick);
            if plan.is_cancelled() {
                return Err(WorkerError::transient("work abandoned after cancellation"));
            }
            progress(step as f32 * 100.0 / steps as f32);
        }
        Ok(())
    }
}

impl ModelWorker for SimulatedWorker {
    fn load(
        &self,
        plan: &WorkPlan,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Footprint, WorkerError> {
        self.run_steps(plan, self.duration_for(plan), progress)?;
        Ok(plan.estimated)
    }

    fn unload(&self, plan: &WorkPlan, progress: &mut dyn FnMut(f32)) -> Result<(), WorkerError> {
        self.run_steps(plan, self.duration_for(plan) / 4, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(size: u64) -> WorkPlan {
        WorkPlan::new(
            OperationId::new(),
            ResourceId::parse("llm").unwrap(),
            OperationKind::Load,
            size,
            Footprint::new(size, size / 2),
            None,
        )
    }

    fn fast_worker() -> SimulatedWorker {
        SimulatedWorker::new(SimulatedWorkerConfig {
            bytes_per_sec: 1_000,
            steps: 4,
            min_duration: Duration::from_millis(4),
            max_duration: Duration::from_millis(40),
        })
    }

    #[test]
    fn simulated_load_reports_increasing_progress() {
        let worker = fast_worker();
        let mut seen = Vec::new();
        let measured = worker
            .load(&plan(10), &mut |value| seen.push(value))
            .unwrap();
        assert_eq!(measured, Footprint::new(10, 5));
        assert_eq!(seen, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn simulated_worker_stops_when_cancelled() {
        let worker = fast_worker();
        let plan = plan(10);
        plan.cancel_flag().store(true, Ordering::Release);
        let error = worker.load(&plan, &mut |_| {}).unwrap_err();
        assert!(!error.fatal);
    }

    #[test]
    fn duration_is_clamped() {
        let worker = fast_worker();
        assert_eq!(worker.duration_for(&plan(0)), Duration::from_millis(4));
        assert_eq!(worker.duration_for(&plan(1_000_000)), Duration::from_millis(40));
    }
}
