use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::LifecycleResult;
use crate::models::{
    BatchMode, BatchOutcome, BatchPlan, BatchPlanner, CapacityBudget, CapacityTracker,
    LifecycleConfig, LifecycleManager, ModelWorker, Operation, OperationId, OperationKind,
    OperationSnapshot, OperationStore, PersistedState, PresetResolver, ResourceCatalog,
    ResourceDescriptor, ResourceFilter, ResourceId, StateFile,
};

use super::events::LifecycleEvent;
use super::poller::OperationPoller;
use super::settings::ManagerSettings;
use super::sweeper::TimeoutSweeper;

/// Everything a front end talks to: the lifecycle manager plus presets,
/// batch planning, polling and the timeout sweeper.
pub struct AppState {
    settings: ManagerSettings,
    manager: LifecycleManager,
    planner: BatchPlanner,
    presets: PresetResolver,
    sweeper: Mutex<Option<TimeoutSweeper>>,
}

impl AppState {
    /// Builds the state with durable persistence at the configured state path,
    /// recovering whatever a previous run left behind.
    pub fn new(settings: ManagerSettings, worker: Arc<dyn ModelWorker>) -> Result<Self> {
        let state_file = StateFile::new(settings.resolved_state_path()?);
        let previous = match state_file.load() {
            Ok(previous) => previous,
            Err(error) => {
                warn!(
                    "ignoring unreadable state at {}: {error:?}",
                    state_file.path().display()
                );
                None
            }
        };
        let state = Self::assemble(settings, worker, previous, Some(state_file))
            .context("failed to start lifecycle manager")?;
        Ok(state)
    }

    /// Builds the state without reading or writing any state file.
    pub fn in_memory(
        settings: ManagerSettings,
        worker: Arc<dyn ModelWorker>,
    ) -> LifecycleResult<Self> {
        Self::assemble(settings, worker, None, None)
    }

    fn assemble(
        settings: ManagerSettings,
        worker: Arc<dyn ModelWorker>,
        previous: Option<PersistedState>,
        state_file: Option<StateFile>,
    ) -> LifecycleResult<Self> {
        let operations = OperationStore::new(settings.retention_per_resource);
        let catalog = match previous {
            Some(mut previous) => {
                let interrupted = previous.recover(OffsetDateTime::now_utc());
                if interrupted > 0 {
                    warn!("{interrupted} operation(s) were interrupted by the last shutdown");
                }
                operations.restore(previous.operations);
                ResourceCatalog::from_descriptors(previous.resources)
            }
            None => ResourceCatalog::default(),
        };
        catalog.sync(settings.resources.iter().cloned());

        let capacity =
            CapacityTracker::new(settings.total_gpu_bytes, settings.system_budget_bytes());
        let config = LifecycleConfig {
            footprint: settings.footprint,
            timeout: settings.timeout,
        };
        let manager =
            LifecycleManager::new(config, catalog, capacity, operations, worker, state_file)?;
        let budget = manager.capacity();
        info!(
            resources = manager.catalog().list(&ResourceFilter::default()).len(),
            gpu_total = budget.total_gpu_bytes,
            gpu_used = budget.used_gpu_bytes,
            system_total = budget.total_system_bytes,
            "lifecycle manager ready"
        );

        Ok(Self {
            presets: PresetResolver::new(settings.presets.clone()),
            planner: BatchPlanner::new(manager.clone()),
            manager,
            settings,
            sweeper: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn manager(&self) -> &LifecycleManager {
        &self.manager
    }

    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn submit_operation(
        &self,
        resource_id: &ResourceId,
        kind: OperationKind,
    ) -> LifecycleResult<Operation> {
        self.manager.submit_operation(resource_id, kind)
    }

    pub fn get_operation(&self, id: OperationId) -> LifecycleResult<OperationSnapshot> {
        self.manager.get_operation(id)
    }

    #[must_use]
    pub fn list_resources(&self, filter: &ResourceFilter) -> Vec<ResourceDescriptor> {
        self.manager.list_resources(filter)
    }

    #[must_use]
    pub fn get_capacity(&self) -> CapacityBudget {
        self.manager.capacity()
    }

    pub fn resolve_preset(&self, name: &str) -> LifecycleResult<Vec<ResourceId>> {
        self.presets.resolve(name)
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.presets.names().map(str::to_string).collect()
    }

    #[must_use]
    pub fn plan_batch(&self, targets: &[ResourceId], mode: BatchMode) -> BatchPlan {
        self.planner.plan(targets, mode)
    }

    pub async fn execute_batch(&self, plan: &BatchPlan) -> BatchOutcome {
        self.planner.execute_batch(plan).await
    }

    /// Resolves, plans and executes a preset in one go.
    pub async fn apply_preset(&self, name: &str, mode: BatchMode) -> LifecycleResult<BatchOutcome> {
        let targets = self.resolve_preset(name)?;
        let plan = self.plan_batch(&targets, mode);
        info!(
            preset = name,
            load = plan.to_load.len(),
            unload = plan.to_unload.len(),
            "applying preset"
        );
        Ok(self.execute_batch(&plan).await)
    }

    pub fn cancel(&self, id: OperationId) -> LifecycleResult<Operation> {
        self.manager.cancel(id)
    }

    pub fn reset_resource(&self, resource_id: &ResourceId) -> LifecycleResult<ResourceDescriptor> {
        self.manager.reset_resource(resource_id)
    }

    pub fn record_usage(
        &self,
        resource_id: &ResourceId,
        requests: u64,
        usage_percentage: f32,
    ) -> LifecycleResult<()> {
        self.manager
            .record_usage(resource_id, requests, usage_percentage)
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<LifecycleEvent> {
        self.manager.events().subscribe()
    }

    /// Starts the timeout sweeper unless it already runs.
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock();
        if guard.as_ref().is_some_and(TimeoutSweeper::is_running) {
            return;
        }
        *guard = Some(TimeoutSweeper::start(
            self.manager.clone(),
            self.settings.sweep_interval(),
        ));
    }

    pub fn stop_sweeper(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }

    #[must_use]
    pub fn poller(&self) -> OperationPoller {
        OperationPoller::new(self.manager.clone(), self.settings.poll_interval())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::LifecycleError;
    use crate::models::{
        OperationStatus, ResourceKind, ResourceSpec, ResourceStatus, SimulatedWorker,
        SimulatedWorkerConfig, INTERRUPTED_MESSAGE,
    };

    fn settings(dir: &std::path::Path) -> ManagerSettings {
        ManagerSettings {
            total_gpu_bytes: 1_000,
            total_system_bytes: Some(1_000),
            resources: vec![ResourceSpec {
                id: ResourceId::parse("asr").unwrap(),
                name: "asr".into(),
                kind: ResourceKind::SpeechRecognition,
                declared_size_bytes: 100,
                location: None,
            }],
            presets: [("voice".to_string(), vec![ResourceId::parse("asr").unwrap()])]
                .into_iter()
                .collect(),
            state_path: Some(dir.join("state.json")),
            poll_interval_ms: 10,
            sweep_interval_ms: 10,
            ..ManagerSettings::default()
        }
    }

    fn worker() -> Arc<dyn ModelWorker> {
        Arc::new(SimulatedWorker::new(SimulatedWorkerConfig {
            bytes_per_sec: 1_000,
            steps: 2,
            min_duration: Duration::from_millis(10),
            max_duration: Duration::from_millis(10),
        }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loaded_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let asr = ResourceId::parse("asr").unwrap();
        {
            let state = AppState::new(settings(dir.path()), worker()).unwrap();
            let outcome = state.apply_preset("voice", BatchMode::Exclusive).await.unwrap();
            let done = state
                .poller()
                .wait_all(&outcome.operation_ids(), |_| {})
                .await
                .unwrap();
            assert_eq!(done[0].status, OperationStatus::Completed);
            // completion is visible to pollers just before the state write
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let restarted = AppState::new(settings(dir.path()), worker()).unwrap();
        let descriptor = restarted.manager().catalog().get(&asr).unwrap();
        assert_eq!(descriptor.status, ResourceStatus::Loaded);
        assert_eq!(restarted.get_capacity().used_gpu_bytes, 80);
        assert_eq!(restarted.manager().operations().history(&asr).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_load_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let asr = ResourceId::parse("asr").unwrap();
        let settings = settings(dir.path());
        let mut previous = PersistedState::new(
            ResourceCatalog::new(settings.resources.clone()).descriptors(),
            Vec::new(),
        );
        previous.resources[0].status = ResourceStatus::Loading;
        let store = OperationStore::new(3);
        store.insert(Operation::pending(
            asr.clone(),
            OperationKind::Load,
            OffsetDateTime::now_utc(),
            Duration::from_secs(60),
        ));
        previous.operations = store.all();
        StateFile::new(settings.resolved_state_path().unwrap())
            .save(&previous)
            .unwrap();

        let state = AppState::new(settings, worker()).unwrap();
        assert_eq!(
            state.manager().catalog().status(&asr),
            Some(ResourceStatus::Unloaded)
        );
        let history = state.manager().operations().history(&asr);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OperationStatus::Failed);
        assert_eq!(history[0].error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(state.get_capacity().used_gpu_bytes, 0);
        assert!(state.submit_operation(&asr, OperationKind::Load).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_preset_and_bad_id_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::in_memory(settings(dir.path()), worker()).unwrap();
        assert!(matches!(
            state.apply_preset("nope", BatchMode::Additive).await,
            Err(LifecycleError::PresetNotFound(_))
        ));
        assert!(matches!(
            ResourceId::parse("Not Valid"),
            Err(LifecycleError::InvalidResourceId(_))
        ));
        assert_eq!(state.preset_names(), vec!["voice".to_string()]);
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweeper_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::in_memory(settings(dir.path()), worker()).unwrap();
        state.start_sweeper();
        state.start_sweeper();
        assert!(state.sweeper.lock().is_some());
        state.stop_sweeper();
        assert!(state.sweeper.lock().is_none());
    }
}
