use thiserror::Error;

use crate::models::{OperationId, OperationStatus, ResourceId, ResourceStatus};

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(
        "capacity exceeded for {resource_id}: requested {requested_gpu_bytes} GPU bytes \
         ({available_gpu_bytes} available), {requested_system_bytes} system bytes \
         ({available_system_bytes} available)"
    )]
    CapacityExceeded {
        resource_id: ResourceId,
        requested_gpu_bytes: u64,
        available_gpu_bytes: u64,
        requested_system_bytes: u64,
        available_system_bytes: u64,
    },

    #[error("{resource_id} already has active operation {operation_id}")]
    ConflictingOperation {
        resource_id: ResourceId,
        operation_id: OperationId,
    },

    #[error("cannot {action} {resource_id} while it is {status:?}")]
    InvalidTransition {
        resource_id: ResourceId,
        status: ResourceStatus,
        action: &'static str,
    },

    #[error("cannot cancel operation {operation_id}: already {status:?}")]
    InvalidOperationTransition {
        operation_id: OperationId,
        status: OperationStatus,
    },

    #[error("operation {operation_id} exceeded its {limit_secs}s limit")]
    TimeoutExceeded {
        operation_id: OperationId,
        limit_secs: u64,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("preset not found: {0}")]
    PresetNotFound(String),

    #[error("invalid resource id {0:?}")]
    InvalidResourceId(String),

    #[error("no async runtime available to run operations")]
    RuntimeUnavailable,

    #[error("state persistence failed: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl LifecycleError {
    /// Whether retrying the same request later can succeed without a caller fix.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LifecycleError::CapacityExceeded { .. }
                | LifecycleError::ConflictingOperation { .. }
                | LifecycleError::TimeoutExceeded { .. }
        )
    }

    /// Short machine-readable label used in batch reports.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::CapacityExceeded { .. } => "capacity-exceeded",
            LifecycleError::ConflictingOperation { .. } => "conflicting-operation",
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::InvalidOperationTransition { .. } => "invalid-transition",
            LifecycleError::TimeoutExceeded { .. } => "timeout-exceeded",
            LifecycleError::ResourceNotFound(_) => "resource-not-found",
            LifecycleError::OperationNotFound(_) => "operation-not-found",
            LifecycleError::PresetNotFound(_) => "preset-not-found",
            LifecycleError::InvalidResourceId(_) => "invalid-resource-id",
            LifecycleError::RuntimeUnavailable => "runtime-unavailable",
            LifecycleError::Persistence(_) => "persistence",
        }
    }
}
