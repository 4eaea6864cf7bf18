mod batch;
mod capacity;
mod catalog;
mod lifecycle;
mod operations;
mod persistence;
mod resource;
mod worker;

pub use batch::{
    plan_batch, BatchItemResult, BatchMode, BatchOutcome, BatchPlan, BatchPlanner, PresetResolver,
    SubmissionResult,
};
pub use capacity::{CapacityBudget, CapacityExceeded, CapacityTracker, Reservation};
pub use catalog::{ResourceCatalog, ResourceFilter};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use operations::{
    Operation, OperationId, OperationKind, OperationSnapshot, OperationStatus, OperationStore,
};
pub use persistence::{PersistedState, StateFile, INTERRUPTED_MESSAGE};
pub use resource::{
    Footprint, FootprintPolicy, ResourceDescriptor, ResourceId, ResourceKind, ResourceSpec,
    ResourceStatus,
};
pub use worker::{ModelWorker, SimulatedWorker, SimulatedWorkerConfig, WorkPlan, WorkerError};
