use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use model_lifecycle::core::settings::ManagerSettings;
use model_lifecycle::models::{
    BatchMode, FootprintPolicy, OperationKind, OperationStatus, ResourceFilter, ResourceId,
    ResourceKind, ResourceSpec, ResourceStatus, SimulatedWorker, SimulatedWorkerConfig,
};
use model_lifecycle::AppState;

const GIB: u64 = 1024 * 1024 * 1024;

fn id(value: &str) -> ResourceId {
    ResourceId::parse(value).unwrap()
}

fn spec(value: &str, gib: u64) -> ResourceSpec {
    ResourceSpec {
        id: id(value),
        name: value.to_uppercase(),
        kind: ResourceKind::LanguageModel,
        declared_size_bytes: gib * GIB,
        location: None,
    }
}

fn state() -> AppState {
    let settings = ManagerSettings {
        total_gpu_bytes: 8 * GIB,
        total_system_bytes: Some(1024 * GIB),
        footprint: FootprintPolicy {
            gpu_multiplier: 1.0,
            system_multiplier: 0.3,
        },
        resources: vec![spec("a", 5), spec("b", 4), spec("c", 2)],
        presets: BTreeMap::from([
            ("all".to_string(), vec![id("a"), id("b"), id("c")]),
            ("just-b".to_string(), vec![id("b")]),
        ]),
        poll_interval_ms: 10,
        ..ManagerSettings::default()
    };
    let worker = SimulatedWorker::new(SimulatedWorkerConfig {
        bytes_per_sec: 1024 * GIB,
        steps: 4,
        min_duration: Duration::from_millis(20),
        max_duration: Duration::from_millis(20),
    });
    AppState::in_memory(settings, Arc::new(worker)).unwrap()
}

fn loaded(state: &AppState) -> BTreeSet<ResourceId> {
    state
        .list_resources(&ResourceFilter {
            status: Some(ResourceStatus::Loaded),
            ..ResourceFilter::default()
        })
        .into_iter()
        .map(|descriptor| descriptor.id)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn smallest_first_admits_two_of_three() {
    let state = state();
    let plan = state.plan_batch(&state.resolve_preset("all").unwrap(), BatchMode::Exclusive);
    assert_eq!(plan.to_load, vec![id("c"), id("a"), id("b")]);
    assert!(plan.to_unload.is_empty());
    let projected = plan.projected.unwrap();
    assert_eq!(projected.used_gpu_bytes, 11 * GIB);
    assert!(!projected.is_within_limits());

    let outcome = state.execute_batch(&plan).await;
    let order: Vec<_> = outcome.items.iter().map(|item| item.resource_id.clone()).collect();
    assert_eq!(order, vec![id("c"), id("a"), id("b")]);
    assert!(outcome.items[0].operation_id().is_some());
    assert!(outcome.items[1].operation_id().is_some());
    assert_eq!(outcome.items[2].rejection_code(), Some("capacity-exceeded"));

    let finished = state
        .poller()
        .wait_all(&outcome.operation_ids(), |_| {})
        .await
        .unwrap();
    assert!(finished
        .iter()
        .all(|operation| operation.status == OperationStatus::Completed));
    assert_eq!(loaded(&state), BTreeSet::from([id("a"), id("c")]));
    assert_eq!(state.get_capacity().used_gpu_bytes, 7 * GIB);
    assert_eq!(
        state.manager().catalog().status(&id("b")),
        Some(ResourceStatus::Unloaded)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusive_switch_frees_capacity_before_loading() {
    let state = state();
    let first = state.apply_preset("all", BatchMode::Exclusive).await.unwrap();
    state
        .poller()
        .wait_all(&first.operation_ids(), |_| {})
        .await
        .unwrap();

    let plan = state.plan_batch(&[id("b")], BatchMode::Exclusive);
    assert_eq!(plan.to_load, vec![id("b")]);
    assert_eq!(plan.to_unload.len(), 2);
    assert_eq!(plan.projected.unwrap().used_gpu_bytes, 4 * GIB);

    let outcome = state.apply_preset("just-b", BatchMode::Exclusive).await.unwrap();
    let kinds: Vec<_> = outcome.items.iter().map(|item| item.kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::Unload, OperationKind::Unload, OperationKind::Load]
    );
    assert!(outcome.rejected().next().is_none());
    state
        .poller()
        .wait_all(&outcome.operation_ids(), |_| {})
        .await
        .unwrap();
    assert_eq!(loaded(&state), BTreeSet::from([id("b")]));
    assert_eq!(state.get_capacity().used_gpu_bytes, 4 * GIB);
}

#[tokio::test(flavor = "multi_thread")]
async fn additive_batch_keeps_existing_loads() {
    let state = state();
    let first = state.execute_batch(&state.plan_batch(&[id("c")], BatchMode::Additive)).await;
    state
        .poller()
        .wait_all(&first.operation_ids(), |_| {})
        .await
        .unwrap();

    let plan = state.plan_batch(&[id("b")], BatchMode::Additive);
    assert!(plan.to_unload.is_empty());
    let outcome = state.execute_batch(&plan).await;
    state
        .poller()
        .wait_all(&outcome.operation_ids(), |_| {})
        .await
        .unwrap();
    assert_eq!(loaded(&state), BTreeSet::from([id("b"), id("c")]));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_targets_are_reported_not_fatal() {
    let state = state();
    let plan = state.plan_batch(&[id("ghost"), id("c")], BatchMode::Additive);
    assert_eq!(plan.to_load, vec![id("c"), id("ghost")]);

    let outcome = state.execute_batch(&plan).await;
    assert!(outcome.items[0].operation_id().is_some());
    assert_eq!(outcome.items[1].rejection_code(), Some("resource-not-found"));
}

#[test]
fn resolve_preset_is_pure() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let state = state();
    let first = state.resolve_preset("all").unwrap();
    let second = state.resolve_preset("all").unwrap();
    assert_eq!(first, second);
    assert_eq!(state.get_capacity().used_gpu_bytes, 0);
    assert!(state.manager().operations().list_active(None).is_empty());
    assert!(state.resolve_preset("none").is_err());
}
