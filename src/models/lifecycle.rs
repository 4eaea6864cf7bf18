//! Per-resource load/unload state machine.
//!
//! ```text
//! Unloaded -> Loading -> Loaded -> Unloading -> Unloaded
//!                |                     |
//!                +------> Error <------+   (fatal worker failure; operator reset)
//! ```
//!
//! Submissions, terminal transitions and their compensations all run under
//! one gate, so "worker finished", "cancelled" and "timed out" cannot both
//! take effect: the first to reach a terminal status wins and the others are
//! no-ops. Progress reports skip the gate and only touch the operation store.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::capacity::{CapacityBudget, CapacityTracker, Reservation};
use super::catalog::{ResourceCatalog, ResourceFilter};
use super::operations::{
    Operation, OperationId, OperationKind, OperationSnapshot, OperationStatus, OperationStore,
};
use super::persistence::{PersistedState, StateFile};
use super::resource::{Footprint, FootprintPolicy, ResourceDescriptor, ResourceId, ResourceStatus};
use super::worker::{ModelWorker, WorkPlan, WorkerError};
use crate::core::events::EventHub;
use crate::core::settings::TimeoutPolicy;
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleConfig {
    pub footprint: FootprintPolicy,
    pub timeout: TimeoutPolicy,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: LifecycleConfig,
    catalog: ResourceCatalog,
    capacity: CapacityTracker,
    operations: OperationStore,
    events: EventHub,
    worker: Arc<dyn ModelWorker>,
    runtime: Handle,
    state_file: Option<StateFile>,
    gate: Mutex<()>,
    // serializes snapshot + write so an older snapshot never lands last
    persist_lock: Mutex<()>,
    // capacity held per resource while loading, loaded, or unloading
    held: Mutex<HashMap<ResourceId, Reservation>>,
    cancel_flags: Mutex<HashMap<OperationId, Arc<AtomicBool>>>,
}

impl LifecycleManager {
    /// Builds a manager around an existing catalog and operation history.
    /// Resources already `Loaded` in the catalog get their capacity reserved
    /// again; any that no longer fit are reverted to `Unloaded`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: LifecycleConfig,
        catalog: ResourceCatalog,
        capacity: CapacityTracker,
        operations: OperationStore,
        worker: Arc<dyn ModelWorker>,
        state_file: Option<StateFile>,
    ) -> LifecycleResult<Self> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::RuntimeUnavailable)?;
        let inner = Arc::new(ManagerInner {
            config,
            catalog,
            capacity,
            operations,
            events: EventHub::new(),
            worker,
            runtime,
            state_file,
            gate: Mutex::new(()),
            persist_lock: Mutex::new(()),
            held: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        });
        inner.adopt_loaded();
        Ok(Self { inner })
    }

    #[must_use]
    pub fn catalog(&self) -> &ResourceCatalog {
        &self.inner.catalog
    }

    #[must_use]
    pub fn operations(&self) -> &OperationStore {
        &self.inner.operations
    }

    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    #[must_use]
    pub fn capacity(&self) -> CapacityBudget {
        self.inner.capacity.budget()
    }

    #[must_use]
    pub fn config(&self) -> LifecycleConfig {
        self.inner.config
    }

    /// Measured footprint if the resource was loaded before, else the estimate.
    #[must_use]
    pub fn footprint_of(&self, id: &ResourceId) -> Option<Footprint> {
        self.inner
            .catalog
            .get(id)
            .map(|descriptor| descriptor.footprint(&self.inner.config.footprint))
    }

    /// Capacity as it would be with `candidates` loaded on top of what is held now.
    #[must_use]
    pub fn project(&self, candidates: &[Footprint]) -> CapacityBudget {
        self.inner.capacity.project(candidates)
    }

    #[must_use]
    pub fn list_resources(&self, filter: &ResourceFilter) -> Vec<ResourceDescriptor> {
        self.inner.catalog.list(filter)
    }

    pub fn get_operation(&self, id: OperationId) -> LifecycleResult<OperationSnapshot> {
        self.inner
            .operations
            .get(id)
            .ok_or(LifecycleError::OperationNotFound(id))
    }

    pub fn submit_operation(
        &self,
        resource_id: &ResourceId,
        kind: OperationKind,
    ) -> LifecycleResult<Operation> {
        match kind {
            OperationKind::Load => self.request_load(resource_id),
            OperationKind::Unload => self.request_unload(resource_id),
        }
    }

    pub fn request_load(&self, resource_id: &ResourceId) -> LifecycleResult<Operation> {
        let inner = &self.inner;
        let (operation, plan) = {
            let _gate = inner.gate.lock();
            let descriptor = inner.admissible(resource_id, ResourceStatus::Unloaded, "load")?;
            let footprint = descriptor.footprint(&inner.config.footprint);
            let reservation = inner.capacity.reserve(resource_id, footprint).map_err(|exceeded| {
                info!(resource = %resource_id, "load rejected: {exceeded}");
                LifecycleError::from(exceeded)
            })?;
            inner.held.lock().insert(resource_id.clone(), reservation);
            inner.begin(&descriptor, OperationKind::Load, footprint)
        };

        info!(
            resource = %resource_id,
            operation = %operation.operation_id,
            gpu = plan.estimated.gpu_bytes,
            "load admitted"
        );
        inner.events.emit_capacity(inner.capacity.budget());
        inner.persist();
        ManagerInner::spawn(&self.inner, plan);
        Ok(operation)
    }

    pub fn request_unload(&self, resource_id: &ResourceId) -> LifecycleResult<Operation> {
        let inner = &self.inner;
        let (operation, plan) = {
            let _gate = inner.gate.lock();
            let descriptor = inner.admissible(resource_id, ResourceStatus::Loaded, "unload")?;
            let footprint = descriptor.footprint(&inner.config.footprint);
            inner.begin(&descriptor, OperationKind::Unload, footprint)
        };

        info!(
            resource = %resource_id,
            operation = %operation.operation_id,
            "unload accepted"
        );
        inner.persist();
        ManagerInner::spawn(&self.inner, plan);
        Ok(operation)
    }

    /// Cancels a pending or running operation. Cancelling an already
    /// cancelled operation returns it unchanged; a completed or failed one is
    /// an invalid transition.
    pub fn cancel(&self, id: OperationId) -> LifecycleResult<Operation> {
        let inner = &self.inner;
        let cancelled = {
            let _gate = inner.gate.lock();
            let operation = inner
                .operations
                .get(id)
                .ok_or(LifecycleError::OperationNotFound(id))?;
            match operation.status {
                OperationStatus::Cancelled => {
                    debug!(operation = %id, "already cancelled");
                    return Ok(operation);
                }
                OperationStatus::Completed | OperationStatus::Failed => {
                    return Err(LifecycleError::InvalidOperationTransition {
                        operation_id: id,
                        status: operation.status,
                    });
                }
                OperationStatus::Pending | OperationStatus::InProgress => {}
            }
            inner
                .terminate_locked(id, OperationStatus::Cancelled, None, false)
                .ok_or(LifecycleError::OperationNotFound(id))?
        };
        info!(operation = %id, resource = %cancelled.resource_id, "operation cancelled");
        inner.persist();
        Ok(cancelled)
    }

    /// Fails every running operation past its deadline. Returns the operations
    /// this call timed out.
    pub fn sweep_expired(&self) -> Vec<Operation> {
        let inner = &self.inner;
        let now = OffsetDateTime::now_utc();
        let mut timed_out = Vec::new();
        for id in inner.operations.expired(now) {
            let _gate = inner.gate.lock();
            let Some(operation) = inner.operations.get(id) else {
                continue;
            };
            let message = LifecycleError::TimeoutExceeded {
                operation_id: id,
                limit_secs: operation.limit_secs(),
            }
            .to_string();
            if let Some(failed) =
                inner.terminate_locked(id, OperationStatus::Failed, Some(message), false)
            {
                warn!(
                    operation = %id,
                    resource = %failed.resource_id,
                    "operation exceeded its time limit"
                );
                timed_out.push(failed);
            }
        }
        if !timed_out.is_empty() {
            inner.persist();
        }
        timed_out
    }

    /// Operator action: moves a resource out of `Error` back to `Unloaded`,
    /// releasing anything still held for it.
    pub fn reset_resource(&self, resource_id: &ResourceId) -> LifecycleResult<ResourceDescriptor> {
        let inner = &self.inner;
        {
            let _gate = inner.gate.lock();
            let status = inner
                .catalog
                .status(resource_id)
                .ok_or_else(|| LifecycleError::ResourceNotFound(resource_id.clone()))?;
            if status != ResourceStatus::Error {
                return Err(LifecycleError::InvalidTransition {
                    resource_id: resource_id.clone(),
                    status,
                    action: "reset",
                });
            }
            inner.release_held(resource_id);
            inner.set_status(resource_id, ResourceStatus::Unloaded);
        }
        info!(resource = %resource_id, "resource reset by operator");
        inner.persist();
        inner
            .catalog
            .get(resource_id)
            .ok_or_else(|| LifecycleError::ResourceNotFound(resource_id.clone()))
    }

    pub fn record_usage(
        &self,
        resource_id: &ResourceId,
        requests: u64,
        usage_percentage: f32,
    ) -> LifecycleResult<()> {
        self.inner
            .catalog
            .record_usage(resource_id, requests, usage_percentage)
    }

    pub async fn wait_terminal(&self, id: OperationId) -> LifecycleResult<OperationSnapshot> {
        self.inner.operations.wait_terminal(id).await
    }
}

impl ManagerInner {
    /// Shared submission checks. Caller holds the gate.
    fn admissible(
        &self,
        resource_id: &ResourceId,
        required: ResourceStatus,
        action: &'static str,
    ) -> LifecycleResult<ResourceDescriptor> {
        let descriptor = self
            .catalog
            .get(resource_id)
            .ok_or_else(|| LifecycleError::ResourceNotFound(resource_id.clone()))?;
        if let Some(active) = self.operations.active_for(resource_id) {
            return Err(LifecycleError::ConflictingOperation {
                resource_id: resource_id.clone(),
                operation_id: active.operation_id,
            });
        }
        if descriptor.status != required {
            return Err(LifecycleError::InvalidTransition {
                resource_id: resource_id.clone(),
                status: descriptor.status,
                action,
            });
        }
        Ok(descriptor)
    }

    /// Records a pending operation and moves the resource into its transitional
    /// status. Caller holds the gate.
    fn begin(
        &self,
        descriptor: &ResourceDescriptor,
        kind: OperationKind,
        footprint: Footprint,
    ) -> (Operation, WorkPlan) {
        let limit = self.config.timeout.limit_for(descriptor.declared_size_bytes);
        let operation = Operation::pending(
            descriptor.id.clone(),
            kind,
            OffsetDateTime::now_utc(),
            limit,
        );
        let plan = WorkPlan::new(
            operation.operation_id,
            descriptor.id.clone(),
            kind,
            descriptor.declared_size_bytes,
            footprint,
            descriptor.location.clone(),
        );
        self.cancel_flags
            .lock()
            .insert(operation.operation_id, plan.cancel_flag());
        self.operations.insert(operation.clone());
        self.events.emit_operation(&operation);

        let transitional = match kind {
            OperationKind::Load => ResourceStatus::Loading,
            OperationKind::Unload => ResourceStatus::Unloading,
        };
        self.set_status(&descriptor.id, transitional);
        (operation, plan)
    }

    fn spawn(this: &Arc<Self>, plan: WorkPlan) {
        let inner = this.clone();
        this.runtime.spawn_blocking(move || inner.execute(plan));
    }

    fn execute(&self, plan: WorkPlan) {
        if !self.operations.mark_in_progress(plan.operation_id) {
            debug!(operation = %plan.operation_id, "operation ended before work started");
            return;
        }
        if let Some(operation) = self.operations.get(plan.operation_id) {
            self.events.emit_operation(&operation);
        }

        let started = Instant::now();
        let mut report = |percentage: f32| self.on_progress(&plan, started, percentage);
        let outcome = catch_unwind(AssertUnwindSafe(|| match plan.kind {
            OperationKind::Load => self.worker.load(&plan, &mut report).map(Some),
            OperationKind::Unload => self.worker.unload(&plan, &mut report).map(|()| None),
        }))
        .unwrap_or_else(|_| Err(WorkerError::transient("worker panicked")));

        match outcome {
            Ok(measured) => self.on_success(&plan, measured),
            Err(failure) => self.on_failure(&plan, failure),
        }
    }

    fn on_progress(&self, plan: &WorkPlan, started: Instant, percentage: f32) {
        let eta = estimate_eta(started.elapsed(), percentage);
        if let Some(operation) = self
            .operations
            .update_progress(plan.operation_id, percentage, eta)
        {
            debug!(
                operation = %plan.operation_id,
                progress = operation.progress_percentage,
                eta = ?operation.eta_seconds,
                "operation progress"
            );
            self.events.emit_operation(&operation);
        }
    }

    fn on_success(&self, plan: &WorkPlan, measured: Option<Footprint>) {
        let resource_id = &plan.resource_id;
        let finished = {
            let _gate = self.gate.lock();
            let still_running = self
                .operations
                .get(plan.operation_id)
                .is_some_and(|operation| !operation.is_terminal());
            if !still_running {
                debug!(operation = %plan.operation_id, "late completion ignored");
                return;
            }

            match plan.kind {
                OperationKind::Load => {
                    let measured = measured.unwrap_or(plan.estimated);
                    let resized = match self.held.lock().get_mut(resource_id) {
                        Some(reservation) => self.capacity.resize(reservation, measured),
                        None => Ok(()),
                    };
                    if let Err(exceeded) = resized {
                        let message = format!("measured footprint does not fit: {exceeded}");
                        warn!(resource = %resource_id, "{message}");
                        self.terminate_locked(
                            plan.operation_id,
                            OperationStatus::Failed,
                            Some(message),
                            false,
                        );
                        None
                    } else {
                        let now = OffsetDateTime::now_utc();
                        let finished = self.operations.finish(
                            plan.operation_id,
                            OperationStatus::Completed,
                            None,
                            now,
                        );
                        let previous = self.catalog.status(resource_id);
                        self.catalog.mark_loaded(resource_id, measured, now);
                        if let Some(previous) = previous {
                            self.events
                                .emit_resource_status(resource_id, previous, ResourceStatus::Loaded);
                        }
                        finished
                    }
                }
                OperationKind::Unload => {
                    let finished = self.operations.finish(
                        plan.operation_id,
                        OperationStatus::Completed,
                        None,
                        OffsetDateTime::now_utc(),
                    );
                    self.set_status(resource_id, ResourceStatus::Unloaded);
                    self.release_held(resource_id);
                    finished
                }
            }
        };

        self.cancel_flags.lock().remove(&plan.operation_id);
        if let Some(operation) = finished {
            info!(
                resource = %resource_id,
                operation = %operation.operation_id,
                kind = ?operation.kind,
                "operation completed"
            );
            self.events.emit_operation(&operation);
            self.events.emit_capacity(self.capacity.budget());
        }
        self.persist();
    }

    fn on_failure(&self, plan: &WorkPlan, failure: WorkerError) {
        let failed = {
            let _gate = self.gate.lock();
            self.terminate_locked(
                plan.operation_id,
                OperationStatus::Failed,
                Some(failure.message.clone()),
                failure.fatal,
            )
        };
        match failed {
            Some(operation) => {
                error!(
                    resource = %operation.resource_id,
                    operation = %operation.operation_id,
                    fatal = failure.fatal,
                    "operation failed: {}",
                    failure.message
                );
                self.persist();
            }
            None => debug!(operation = %plan.operation_id, "failure after terminal state ignored"),
        }
    }

    /// Moves a running operation to `Failed` or `Cancelled` and undoes its
    /// effects: a load gives back its reservation, an unload keeps it, and the
    /// resource returns to its pre-operation status (or `Error` when `fatal`).
    /// Returns `None` if the operation had already finished. Caller holds the gate.
    fn terminate_locked(
        &self,
        id: OperationId,
        status: OperationStatus,
        message: Option<String>,
        fatal: bool,
    ) -> Option<Operation> {
        let operation = self
            .operations
            .finish(id, status, message, OffsetDateTime::now_utc())?;
        if let Some(flag) = self.cancel_flags.lock().remove(&id) {
            flag.store(true, Ordering::Release);
        }

        let resource_id = &operation.resource_id;
        let next = match (operation.kind, fatal) {
            (OperationKind::Load, false) => {
                self.release_held(resource_id);
                ResourceStatus::Unloaded
            }
            (OperationKind::Load, true) => {
                self.release_held(resource_id);
                ResourceStatus::Error
            }
            (OperationKind::Unload, false) => ResourceStatus::Loaded,
            // memory state unknown; capacity stays held until reset
            (OperationKind::Unload, true) => ResourceStatus::Error,
        };
        self.set_status(resource_id, next);
        self.events.emit_operation(&operation);
        self.events.emit_capacity(self.capacity.budget());
        Some(operation)
    }

    fn release_held(&self, resource_id: &ResourceId) {
        if let Some(reservation) = self.held.lock().remove(resource_id) {
            self.capacity.release(&reservation);
        }
    }

    fn set_status(&self, resource_id: &ResourceId, status: ResourceStatus) {
        if let Some(previous) = self.catalog.set_status(resource_id, status) {
            debug!(resource = %resource_id, from = ?previous, to = ?status, "resource status");
            self.events.emit_resource_status(resource_id, previous, status);
        }
    }

    fn adopt_loaded(&self) {
        let loaded = self.catalog.list(&ResourceFilter {
            status: Some(ResourceStatus::Loaded),
            ..ResourceFilter::default()
        });
        for descriptor in loaded {
            let footprint = descriptor.footprint(&self.config.footprint);
            match self.capacity.reserve(&descriptor.id, footprint) {
                Ok(reservation) => {
                    self.held.lock().insert(descriptor.id.clone(), reservation);
                }
                Err(exceeded) => {
                    warn!(
                        resource = %descriptor.id,
                        "loaded resource no longer fits the budget, marking unloaded: {exceeded}"
                    );
                    self.catalog
                        .set_status(&descriptor.id, ResourceStatus::Unloaded);
                }
            }
        }
    }

    fn persist(&self) {
        let Some(state_file) = &self.state_file else {
            return;
        };
        let _writing = self.persist_lock.lock();
        let state = PersistedState::new(self.catalog.descriptors(), self.operations.all());
        if let Err(error) = state_file.save(&state) {
            warn!("failed to persist lifecycle state: {error:?}");
        }
    }
}

fn estimate_eta(elapsed: Duration, percentage: f32) -> Option<u64> {
    if !percentage.is_finite() || percentage <= 0.0 {
        return None;
    }
    if percentage >= 100.0 {
        return Some(0);
    }
    let percentage = f64::from(percentage);
    let remaining = elapsed.as_secs_f64() * (100.0 - percentage) / percentage;
    Some(remaining.ceil() as u64)
}
