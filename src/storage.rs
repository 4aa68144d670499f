//! Bookkeeping for identities parked inside fixed-position containers.
//!
//! Each container position owns a FIFO of stable ids. When the container
//! re-emits an entity, the first queued identity of the same kind gets it.
//! If exact-position data is missing the tracker falls back to the nearest
//! stored identity of that kind within a bounded radius.

use crate::capture::CaptureCorrelator;
use crate::expiring::ExpiringCache;
use crate::registry::{IdentityRegistry, RegistryError};
use crate::types::{
    BlockPos, EntityKind, LifecycleState, OwnerId, Position, SpatialBucket, StableId,
};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use web_time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHint {
    pub actor: OwnerId,
    pub container: BlockPos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkOutcome {
    Stored,
    /// Capture bookkeeping already owns this identity.
    AlreadyCaptured,
}

pub struct StorageTracker {
    slots: Mutex<HashMap<BlockPos, VecDeque<StableId>>>,
    hints: ExpiringCache<SpatialBucket, ContainerHint>,
    proximity_radius: f64,
}

impl StorageTracker {
    pub fn new(hint_ttl: Duration, proximity_radius: f64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hints: ExpiringCache::new(hint_ttl),
            proximity_radius,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<BlockPos, VecDeque<StableId>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A user interacted with the container at `container`; removals in the
    /// same bucket during the hint TTL are attributed to it.
    pub fn note_container_use(&self, actor: OwnerId, container: BlockPos, now: Instant) {
        self.hints
            .insert_at(container.bucket(), ContainerHint { actor, container }, now);
    }

    pub fn hinted_container(&self, position: &Position, now: Instant) -> Option<BlockPos> {
        self.hints
            .get_at(&position.bucket(), now)
            .map(|hint| hint.container)
    }

    pub fn sweep_hints(&self, now: Instant) -> usize {
        self.hints.sweep_at(now)
    }

    pub fn park(
        &self,
        registry: &IdentityRegistry,
        capture: &CaptureCorrelator,
        stable_id: StableId,
        container: BlockPos,
        now: Instant,
    ) -> Result<ParkOutcome, RegistryError> {
        let record = registry
            .get(stable_id)
            .ok_or(RegistryError::UnknownIdentity(stable_id))?;
        if record.state == LifecycleState::Captured || capture.has_pending_for(stable_id, now) {
            return Ok(ParkOutcome::AlreadyCaptured);
        }
        registry.mark_stored(stable_id, container.clone())?;

        let mut slots = self.slots();
        for queue in slots.values_mut() {
            queue.retain(|queued| *queued != stable_id);
        }
        slots.retain(|_, queue| !queue.is_empty());
        log::debug!("stored {} in container {}", stable_id, container);
        slots.entry(container).or_default().push_back(stable_id);
        Ok(ParkOutcome::Stored)
    }

    /// Pops the oldest identity of `kind` queued at exactly `container`.
    pub fn unpark_exact(
        &self,
        registry: &IdentityRegistry,
        container: &BlockPos,
        kind: Option<&EntityKind>,
    ) -> Option<StableId> {
        let mut slots = self.slots();
        let queue = slots.get_mut(container)?;
        queue.retain(|queued| {
            registry
                .get(*queued)
                .map_or(false, |record| record.state == LifecycleState::Stored)
        });
        let index = queue.iter().position(|queued| {
            registry
                .get(*queued)
                .map_or(false, |record| record.kind_matches(kind))
        });
        let stable_id = index.and_then(|index| queue.remove(index));
        if queue.is_empty() {
            slots.remove(container);
        }
        stable_id
    }

    /// Nearest stored identity of `kind` within the proximity radius.
    pub fn unpark_nearby(
        &self,
        registry: &IdentityRegistry,
        position: &Position,
        kind: Option<&EntityKind>,
    ) -> Option<StableId> {
        let radius2 = self.proximity_radius * self.proximity_radius;
        let stable_id = registry
            .records_in_state(LifecycleState::Stored)
            .into_iter()
            .filter(|record| record.kind_matches(kind))
            .filter_map(|record| {
                record
                    .last_position
                    .distance2(position)
                    .filter(|d2| *d2 <= radius2)
                    .map(|d2| (d2, record.stable_id))
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .map(|(_, stable_id)| stable_id)?;
        self.forget(stable_id);
        Some(stable_id)
    }

    /// Puts `stable_id` back at the head of `container`'s queue after an
    /// unpark that could not be completed.
    pub fn requeue(&self, container: BlockPos, stable_id: StableId) {
        let mut slots = self.slots();
        let queue = slots.entry(container).or_default();
        if !queue.contains(&stable_id) {
            queue.push_front(stable_id);
        }
    }

    pub fn forget(&self, stable_id: StableId) {
        let mut slots = self.slots();
        for queue in slots.values_mut() {
            queue.retain(|queued| *queued != stable_id);
        }
        slots.retain(|_, queue| !queue.is_empty());
    }

    pub fn occupants(&self, container: &BlockPos) -> Vec<StableId> {
        self.slots()
            .get(container)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rebuilds every slot from the registry's stored records, oldest first.
    pub fn rebuild(&self, registry: &IdentityRegistry) -> usize {
        let mut stored = registry.records_in_state(LifecycleState::Stored);
        stored.sort_by_key(|record| record.updated_at_ms);
        let mut slots = self.slots();
        slots.clear();
        for record in &stored {
            let container = record
                .container
                .clone()
                .unwrap_or_else(|| record.last_position.block());
            slots.entry(container).or_default().push_back(record.stable_id);
        }
        stored.len()
    }
}
