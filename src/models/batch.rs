use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::capacity::CapacityBudget;
use super::lifecycle::LifecycleManager;
use super::operations::{OperationId, OperationKind, OperationStatus};
use super::resource::ResourceId;
use crate::error::{LifecycleError, LifecycleResult};

// extra wait on top of an unload's own limit before sweeping it ourselves
const UNLOAD_GRACE: Duration = Duration::from_secs(1);

/// Named target sets from static configuration.
#[derive(Debug, Clone, Default)]
pub struct PresetResolver {
    presets: BTreeMap<String, Vec<ResourceId>>,
}

impl PresetResolver {
    #[must_use]
    pub fn new(presets: BTreeMap<String, Vec<ResourceId>>) -> Self {
        Self { presets }
    }

    pub fn resolve(&self, name: &str) -> LifecycleResult<Vec<ResourceId>> {
        self.presets
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::PresetNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    /// Load the targets and unload everything else.
    #[default]
    Exclusive,
    /// Load the targets and leave other loaded resources alone.
    Additive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    pub mode: BatchMode,
    pub to_load: Vec<ResourceId>,
    pub to_unload: Vec<ResourceId>,
    /// Capacity after the whole plan, if every load were admitted.
    pub projected: Option<CapacityBudget>,
}

impl BatchPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_unload.is_empty()
    }
}

/// Diffs `targets` against `loaded`. Duplicates are dropped and the first
/// occurrence keeps its position.
#[must_use]
pub fn plan_batch(targets: &[ResourceId], loaded: &[ResourceId], mode: BatchMode) -> BatchPlan {
    let loaded_set: HashSet<&ResourceId> = loaded.iter().collect();
    let target_set: HashSet<&ResourceId> = targets.iter().collect();

    let mut seen = HashSet::new();
    let to_load = targets
        .iter()
        .filter(|id| !loaded_set.contains(id))
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect();

    let to_unload = match mode {
        BatchMode::Additive => Vec::new(),
        BatchMode::Exclusive => {
            let mut seen = HashSet::new();
            loaded
                .iter()
                .filter(|id| !target_set.contains(id))
                .filter(|id| seen.insert(*id))
                .cloned()
                .collect()
        }
    };

    BatchPlan {
        mode,
        to_load,
        to_unload,
        projected: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SubmissionResult {
    #[serde(rename_all = "camelCase")]
    Submitted {
        operation_id: OperationId,
        status: OperationStatus,
    },
    Rejected {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub result: SubmissionResult,
}

impl BatchItemResult {
    fn from_submission(
        resource_id: ResourceId,
        kind: OperationKind,
        submission: LifecycleResult<super::operations::Operation>,
    ) -> Self {
        let result = match submission {
            Ok(operation) => SubmissionResult::Submitted {
                operation_id: operation.operation_id,
                status: operation.status,
            },
            Err(error) => SubmissionResult::Rejected {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        };
        Self {
            resource_id,
            kind,
            result,
        }
    }

    #[must_use]
    pub fn operation_id(&self) -> Option<OperationId> {
        match &self.result {
            SubmissionResult::Submitted { operation_id, .. } => Some(*operation_id),
            SubmissionResult::Rejected { .. } => None,
        }
    }

    #[must_use]
    pub fn rejection_code(&self) -> Option<&str> {
        match &self.result {
            SubmissionResult::Rejected { code, .. } => Some(code),
            SubmissionResult::Submitted { .. } => None,
        }
    }
}

/// Per-resource results in submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub items: Vec<BatchItemResult>,
}

impl BatchOutcome {
    #[must_use]
    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.items
            .iter()
            .filter_map(BatchItemResult::operation_id)
            .collect()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items
            .iter()
            .filter(|item| item.rejection_code().is_some())
    }
}

/// Turns target sets into ordered submissions against a [`LifecycleManager`].
#[derive(Clone)]
pub struct BatchPlanner {
    manager: LifecycleManager,
}

impl BatchPlanner {
    #[must_use]
    pub fn new(manager: LifecycleManager) -> Self {
        Self { manager }
    }

    /// [`plan_batch`] against the currently loaded set, with loads in
    /// submission order and a capacity projection attached.
    #[must_use]
    pub fn plan(&self, targets: &[ResourceId], mode: BatchMode) -> BatchPlan {
        let loaded = self.manager.catalog().loaded_ids();
        let mut plan = plan_batch(targets, &loaded, mode);
        plan.to_load = self.load_order(&plan.to_load);
        plan.projected = Some(self.project(&plan));
        plan
    }

    /// Ascending declared size, ties by id; unknown ids go last.
    #[must_use]
    pub fn load_order(&self, ids: &[ResourceId]) -> Vec<ResourceId> {
        let catalog = self.manager.catalog();
        let mut ordered: Vec<(Option<u64>, ResourceId)> = ids
            .iter()
            .map(|id| (catalog.get(id).map(|d| d.declared_size_bytes), id.clone()))
            .collect();
        ordered.sort_by(|(a_size, a_id), (b_size, b_id)| match (a_size, b_size) {
            (Some(a), Some(b)) => a.cmp(b).then_with(|| a_id.cmp(b_id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a_id.cmp(b_id),
        });
        ordered.into_iter().map(|(_, id)| id).collect()
    }

    fn project(&self, plan: &BatchPlan) -> CapacityBudget {
        let loads: Vec<_> = plan
            .to_load
            .iter()
            .filter_map(|id| self.manager.footprint_of(id))
            .collect();
        plan.to_unload
            .iter()
            .filter_map(|id| self.manager.footprint_of(id))
            .fold(self.manager.project(&loads), CapacityBudget::with_removed)
    }

    /// Submits every unload, waits for them to settle so their capacity is
    /// free, then submits loads smallest first. Not atomic: each resource
    /// succeeds or fails on its own.
    pub async fn execute_batch(&self, plan: &BatchPlan) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for resource_id in &plan.to_unload {
            let submission = self.manager.request_unload(resource_id);
            outcome.items.push(BatchItemResult::from_submission(
                resource_id.clone(),
                OperationKind::Unload,
                submission,
            ));
        }
        let unloads: Vec<OperationId> = outcome.operation_ids();
        for operation_id in unloads {
            self.settle(operation_id).await;
        }

        for resource_id in self.load_order(&plan.to_load) {
            let submission = self.manager.request_load(&resource_id);
            if let Err(error) = &submission {
                info!(resource = %resource_id, "batch load rejected: {error}");
            }
            outcome.items.push(BatchItemResult::from_submission(
                resource_id,
                OperationKind::Load,
                submission,
            ));
        }

        info!(
            submitted = outcome.operation_ids().len(),
            rejected = outcome.rejected().count(),
            "batch submitted"
        );
        outcome
    }

    async fn settle(&self, operation_id: OperationId) {
        let Ok(operation) = self.manager.get_operation(operation_id) else {
            return;
        };
        let limit = Duration::from_secs(operation.limit_secs()) + UNLOAD_GRACE;
        match tokio::time::timeout(limit, self.manager.wait_terminal(operation_id)).await {
            Ok(Ok(done)) if done.status != OperationStatus::Completed => {
                warn!(
                    operation = %operation_id,
                    resource = %done.resource_id,
                    status = ?done.status,
                    "batch unload did not complete"
                );
            }
            Ok(_) => {}
            Err(_) => {
                warn!(operation = %operation_id, "batch unload overran its limit");
                self.manager.sweep_expired();
            }
        }
    }
}
