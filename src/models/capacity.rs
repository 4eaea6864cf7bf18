//! Process-wide GPU/system memory budget with linearizable admission.
//!
//! Every reservation is checked and committed under one lock, so two
//! concurrent `reserve` calls can never both succeed when their combined
//! footprint would exceed the budget.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::resource::{Footprint, ResourceId};
use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CapacityBudget {
    pub total_gpu_bytes: u64,
    pub used_gpu_bytes: u64,
    pub total_system_bytes: u64,
    pub used_system_bytes: u64,
}

impl CapacityBudget {
    #[must_use]
    pub fn new(total_gpu_bytes: u64, total_system_bytes: u64) -> Self {
        Self {
            total_gpu_bytes,
            used_gpu_bytes: 0,
            total_system_bytes,
            used_system_bytes: 0,
        }
    }

    #[must_use]
    pub fn available(&self) -> Footprint {
        Footprint::new(
            self.total_gpu_bytes.saturating_sub(self.used_gpu_bytes),
            self.total_system_bytes.saturating_sub(self.used_system_bytes),
        )
    }

    #[must_use]
    pub fn fits(&self, footprint: Footprint) -> bool {
        self.used_gpu_bytes.saturating_add(footprint.gpu_bytes) <= self.total_gpu_bytes
            && self.used_system_bytes.saturating_add(footprint.system_bytes)
                <= self.total_system_bytes
    }

    /// True while neither used figure exceeds its total.
    #[must_use]
    pub fn is_within_limits(&self) -> bool {
        self.used_gpu_bytes <= self.total_gpu_bytes
            && self.used_system_bytes <= self.total_system_bytes
    }

    #[must_use]
    pub fn with_added(mut self, footprint: Footprint) -> Self {
        self.used_gpu_bytes = self.used_gpu_bytes.saturating_add(footprint.gpu_bytes);
        self.used_system_bytes = self.used_system_bytes.saturating_add(footprint.system_bytes);
        self
    }

    #[must_use]
    pub fn with_removed(mut self, footprint: Footprint) -> Self {
        self.used_gpu_bytes = self.used_gpu_bytes.saturating_sub(footprint.gpu_bytes);
        self.used_system_bytes = self.used_system_bytes.saturating_sub(footprint.system_bytes);
        self
    }
}

/// Capacity provisionally committed to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    id: Uuid,
    resource_id: ResourceId,
    footprint: Footprint,
}

impl Reservation {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    #[must_use]
    pub fn footprint(&self) -> Footprint {
        self.footprint
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("capacity exceeded for {resource_id}: requested {requested:?}, available {available:?}")]
pub struct CapacityExceeded {
    pub resource_id: ResourceId,
    pub requested: Footprint,
    pub available: Footprint,
}

impl From<CapacityExceeded> for LifecycleError {
    fn from(error: CapacityExceeded) -> Self {
        LifecycleError::CapacityExceeded {
            resource_id: error.resource_id,
            requested_gpu_bytes: error.requested.gpu_bytes,
            available_gpu_bytes: error.available.gpu_bytes,
            requested_system_bytes: error.requested.system_bytes,
            available_system_bytes: error.available.system_bytes,
        }
    }
}

struct TrackerState {
    budget: CapacityBudget,
    reservations: HashMap<Uuid, Footprint>,
}

pub struct CapacityTracker {
    inner: Mutex<TrackerState>,
}

impl CapacityTracker {
    #[must_use]
    pub fn new(total_gpu_bytes: u64, total_system_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                budget: CapacityBudget::new(total_gpu_bytes, total_system_bytes),
                reservations: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn budget(&self) -> CapacityBudget {
        self.inner.lock().budget
    }

    pub fn reserve(
        &self,
        resource_id: &ResourceId,
        footprint: Footprint,
    ) -> Result<Reservation, CapacityExceeded> {
        let mut state = self.inner.lock();
        if !state.budget.fits(footprint) {
            debug!(
                resource = %resource_id,
                gpu = footprint.gpu_bytes,
                system = footprint.system_bytes,
                "admission rejected"
            );
            return Err(CapacityExceeded {
                resource_id: resource_id.clone(),
                requested: footprint,
                available: state.budget.available(),
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            resource_id: resource_id.clone(),
            footprint,
        };
        state.budget = state.budget.with_added(footprint);
        state.reservations.insert(reservation.id, footprint);
        debug!(
            resource = %resource_id,
            gpu = footprint.gpu_bytes,
            used_gpu = state.budget.used_gpu_bytes,
            "capacity reserved"
        );
        Ok(reservation)
    }

    /// Returns the reservation's capacity to the pool. A second release of the
    /// same reservation is ignored and reported as `false`.
    pub fn release(&self, reservation: &Reservation) -> bool {
        let mut state = self.inner.lock();
        let Some(held) = state.reservations.remove(&reservation.id) else {
            warn!(
                reservation = %reservation.id,
                resource = %reservation.resource_id,
                "reservation already released; ignoring"
            );
            return false;
        };
        state.budget = state.budget.with_removed(held);
        debug!(
            resource = %reservation.resource_id,
            used_gpu = state.budget.used_gpu_bytes,
            "capacity released"
        );
        true
    }

    /// Changes a live reservation to `footprint`. Shrinking always succeeds;
    /// growing must fit in what is left of the budget.
    pub fn resize(
        &self,
        reservation: &mut Reservation,
        footprint: Footprint,
    ) -> Result<(), CapacityExceeded> {
        let mut state = self.inner.lock();
        let Some(held) = state.reservations.get(&reservation.id).copied() else {
            warn!(
                reservation = %reservation.id,
                resource = %reservation.resource_id,
                "resize of released reservation ignored"
            );
            return Ok(());
        };

        let without = state.budget.with_removed(held);
        if !without.fits(footprint) {
            return Err(CapacityExceeded {
                resource_id: reservation.resource_id.clone(),
                requested: footprint,
                available: without.available(),
            });
        }

        state.budget = without.with_added(footprint);
        state.reservations.insert(reservation.id, footprint);
        reservation.footprint = footprint;
        Ok(())
    }

    #[must_use]
    pub fn is_held(&self, reservation: &Reservation) -> bool {
        self.inner.lock().reservations.contains_key(&reservation.id)
    }

    /// The budget as it would look with every candidate loaded on top of the
    /// current reservations. Does not mutate anything.
    #[must_use]
    pub fn project(&self, candidates: &[Footprint]) -> CapacityBudget {
        let current = self.budget();
        candidates
            .iter()
            .fold(current, |budget, footprint| budget.with_added(*footprint))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn id(value: &str) -> ResourceId {
        ResourceId::parse(value).unwrap()
    }

    #[test]
    fn reserve_commits_when_both_budgets_fit() {
        let tracker = CapacityTracker::new(8 * GIB, 16 * GIB);
        let reservation = tracker
            .reserve(&id("llm"), Footprint::new(5 * GIB, 2 * GIB))
            .unwrap();
        let budget = tracker.budget();
        assert_eq!(budget.used_gpu_bytes, 5 * GIB);
        assert_eq!(budget.used_system_bytes, 2 * GIB);
        assert!(tracker.is_held(&reservation));
    }

    #[test]
    fn reserve_rejects_without_mutating() {
        let tracker = CapacityTracker::new(8 * GIB, 16 * GIB);
        tracker
            .reserve(&id("a"), Footprint::new(7 * GIB, GIB))
            .unwrap();
        let before = tracker.budget();

        let error = tracker
            .reserve(&id("b"), Footprint::new(4 * GIB, GIB))
            .unwrap_err();
        assert_eq!(error.available.gpu_bytes, GIB);
        assert_eq!(tracker.budget(), before);
    }

    #[test]
    fn system_budget_is_also_enforced() {
        let tracker = CapacityTracker::new(8 * GIB, GIB);
        let result = tracker.reserve(&id("a"), Footprint::new(GIB, 2 * GIB));
        assert!(result.is_err());
        assert_eq!(tracker.budget().used_gpu_bytes, 0);
    }

    #[test]
    fn double_release_is_a_no_op() {
        let tracker = CapacityTracker::new(8 * GIB, 8 * GIB);
        let first = tracker
            .reserve(&id("a"), Footprint::new(3 * GIB, GIB))
            .unwrap();
        let _second = tracker
            .reserve(&id("b"), Footprint::new(2 * GIB, GIB))
            .unwrap();

        assert!(tracker.release(&first));
        assert!(!tracker.release(&first));
        assert_eq!(tracker.budget().used_gpu_bytes, 2 * GIB);
        assert_eq!(tracker.budget().used_system_bytes, GIB);
    }

    #[test]
    fn resize_shrinks_and_guards_growth() {
        let tracker = CapacityTracker::new(8 * GIB, 8 * GIB);
        let mut reservation = tracker
            .reserve(&id("a"), Footprint::new(4 * GIB, GIB))
            .unwrap();
        tracker
            .reserve(&id("b"), Footprint::new(3 * GIB, GIB))
            .unwrap();

        tracker
            .resize(&mut reservation, Footprint::new(2 * GIB, GIB))
            .unwrap();
        assert_eq!(tracker.budget().used_gpu_bytes, 5 * GIB);
        assert_eq!(reservation.footprint().gpu_bytes, 2 * GIB);

        let error = tracker
            .resize(&mut reservation, Footprint::new(6 * GIB, GIB))
            .unwrap_err();
        assert_eq!(error.available.gpu_bytes, 5 * GIB);
        assert_eq!(tracker.budget().used_gpu_bytes, 5 * GIB);
        assert_eq!(reservation.footprint().gpu_bytes, 2 * GIB);
    }

    #[test]
    fn project_does_not_mutate() {
        let tracker = CapacityTracker::new(8 * GIB, 8 * GIB);
        tracker
            .reserve(&id("a"), Footprint::new(2 * GIB, GIB))
            .unwrap();
        let projected = tracker.project(&[
            Footprint::new(5 * GIB, GIB),
            Footprint::new(4 * GIB, GIB),
        ]);
        assert_eq!(projected.used_gpu_bytes, 11 * GIB);
        assert!(!projected.is_within_limits());
        assert_eq!(tracker.budget().used_gpu_bytes, 2 * GIB);
    }

    #[test]
    fn concurrent_admission_never_oversubscribes() {
        let tracker = Arc::new(CapacityTracker::new(10 * GIB, 100 * GIB));
        let handles: Vec<_> = (0..16)
            .map(|index| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    tracker
                        .reserve(&id(&format!("m{index}")), Footprint::new(3 * GIB, GIB))
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(tracker.budget().used_gpu_bytes, 9 * GIB);
    }
}
