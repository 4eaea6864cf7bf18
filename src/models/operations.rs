//! Load/unload job records with bounded per-resource history.
//!
//! Readers always get owned copies, so polling never holds a lock across an
//! await point and never observes a half-applied update.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::resource::ResourceId;
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Load,
    Unload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_id: OperationId,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub progress_percentage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub started_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub deadline_at: OffsetDateTime,
}

/// What pollers receive; identical on every read once the operation is terminal.
pub type OperationSnapshot = Operation;

impl Operation {
    pub(crate) fn pending(
        resource_id: ResourceId,
        kind: OperationKind,
        now: OffsetDateTime,
        limit: std::time::Duration,
    ) -> Self {
        let limit = time::Duration::try_from(limit).unwrap_or(time::Duration::MAX);
        Self {
            operation_id: OperationId::new(),
            resource_id,
            kind,
            status: OperationStatus::Pending,
            progress_percentage: 0.0,
            eta_seconds: None,
            started_at: now,
            completed_at: None,
            error_message: None,
            deadline_at: now.saturating_add(limit),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whole seconds allowed between submission and the deadline.
    #[must_use]
    pub fn limit_secs(&self) -> u64 {
        (self.deadline_at - self.started_at).whole_seconds().max(0) as u64
    }
}

#[derive(Default)]
struct StoreState {
    operations: HashMap<OperationId, Operation>,
    // terminal ids per resource, oldest completion first
    history: HashMap<ResourceId, VecDeque<OperationId>>,
}

pub struct OperationStore {
    inner: RwLock<StoreState>,
    retention: usize,
    terminal_tx: watch::Sender<u64>,
}

impl OperationStore {
    #[must_use]
    pub fn new(retention: usize) -> Self {
        let (terminal_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreState::default()),
            retention: retention.max(1),
            terminal_tx,
        }
    }

    #[must_use]
    pub fn retention(&self) -> usize {
        self.retention
    }

    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<OperationSnapshot> {
        self.inner.read().operations.get(&id).cloned()
    }

    /// Non-terminal operations, optionally for a single resource.
    #[must_use]
    pub fn list_active(&self, resource_id: Option<&ResourceId>) -> Vec<Operation> {
        let mut active: Vec<Operation> = self
            .inner
            .read()
            .operations
            .values()
            .filter(|op| !op.is_terminal())
            .filter(|op| resource_id.map_or(true, |id| &op.resource_id == id))
            .cloned()
            .collect();
        active.sort_by_key(|op| op.started_at);
        active
    }

    #[must_use]
    pub fn active_for(&self, resource_id: &ResourceId) -> Option<Operation> {
        self.list_active(Some(resource_id)).into_iter().next()
    }

    /// Retained terminal operations for a resource, oldest completion first.
    #[must_use]
    pub fn history(&self, resource_id: &ResourceId) -> Vec<Operation> {
        let state = self.inner.read();
        state
            .history
            .get(resource_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.operations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Non-terminal operations whose deadline is at or before `now`.
    #[must_use]
    pub fn expired(&self, now: OffsetDateTime) -> Vec<OperationId> {
        self.inner
            .read()
            .operations
            .values()
            .filter(|op| !op.is_terminal() && op.deadline_at <= now)
            .map(|op| op.operation_id)
            .collect()
    }

    /// Resolves once `id` is terminal.
    pub async fn wait_terminal(&self, id: OperationId) -> LifecycleResult<OperationSnapshot> {
        let mut terminal_rx = self.terminal_tx.subscribe();
        loop {
            let operation = self.get(id).ok_or(LifecycleError::OperationNotFound(id))?;
            if operation.is_terminal() {
                return Ok(operation);
            }
            if terminal_rx.changed().await.is_err() {
                return Err(LifecycleError::OperationNotFound(id));
            }
        }
    }

    pub(crate) fn insert(&self, operation: Operation) {
        debug!(
            operation = %operation.operation_id,
            resource = %operation.resource_id,
            kind = ?operation.kind,
            "operation recorded"
        );
        self.inner
            .write()
            .operations
            .insert(operation.operation_id, operation);
    }

    /// Pending -> InProgress. Returns false if the operation already moved on.
    pub(crate) fn mark_in_progress(&self, id: OperationId) -> bool {
        let mut state = self.inner.write();
        match state.operations.get_mut(&id) {
            Some(op) if op.status == OperationStatus::Pending => {
                op.status = OperationStatus::InProgress;
                true
            }
            _ => false,
        }
    }

    /// Applies a progress report if the operation is still running and the
    /// value does not go backwards.
    pub(crate) fn update_progress(
        &self,
        id: OperationId,
        percentage: f32,
        eta_seconds: Option<u64>,
    ) -> Option<Operation> {
        let percentage = if percentage.is_finite() {
            percentage.clamp(0.0, 100.0)
        } else {
            return None;
        };
        let mut state = self.inner.write();
        let op = state.operations.get_mut(&id)?;
        if op.is_terminal() || percentage < op.progress_percentage {
            return None;
        }
        op.status = OperationStatus::InProgress;
        op.progress_percentage = percentage;
        op.eta_seconds = eta_seconds;
        Some(op.clone())
    }

    /// Moves a running operation to a terminal status. Only the first caller
    /// wins; later calls see `None` and must not compensate again.
    pub(crate) fn finish(
        &self,
        id: OperationId,
        status: OperationStatus,
        error_message: Option<String>,
        now: OffsetDateTime,
    ) -> Option<Operation> {
        debug_assert!(status.is_terminal());
        let finished = {
            let mut state = self.inner.write();
            let op = state.operations.get_mut(&id)?;
            if op.is_terminal() {
                return None;
            }
            op.status = status;
            op.completed_at = Some(now);
            op.eta_seconds = None;
            if status == OperationStatus::Completed {
                op.progress_percentage = 100.0;
            }
            if status == OperationStatus::Failed {
                op.error_message = error_message;
            }
            let finished = op.clone();
            self.retain(&mut state, &finished.resource_id, id);
            finished
        };
        self.terminal_tx.send_modify(|generation| *generation += 1);
        Some(finished)
    }

    pub(crate) fn all(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> =
            self.inner.read().operations.values().cloned().collect();
        operations.sort_by_key(|op| op.started_at);
        operations
    }

    /// Reloads persisted operations; terminal ones re-enter history in
    /// completion order.
    pub(crate) fn restore(&self, mut operations: Vec<Operation>) {
        operations.sort_by_key(|op| op.completed_at.unwrap_or(op.started_at));
        let mut state = self.inner.write();
        for operation in operations {
            let id = operation.operation_id;
            let resource_id = operation.resource_id.clone();
            let terminal = operation.is_terminal();
            state.operations.insert(id, operation);
            if terminal {
                self.retain(&mut state, &resource_id, id);
            }
        }
    }

    fn retain(&self, state: &mut StoreState, resource_id: &ResourceId, id: OperationId) {
        let history = state.history.entry(resource_id.clone()).or_default();
        history.push_back(id);
        let mut evicted = Vec::new();
        while history.len() > self.retention {
            if let Some(oldest) = history.pop_front() {
                evicted.push(oldest);
            }
        }
        for oldest in evicted {
            state.operations.remove(&oldest);
            debug!(operation = %oldest, resource = %resource_id, "operation evicted from history");
        }
    }
}
