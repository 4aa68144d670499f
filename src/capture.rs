//! Links a protocol-level "capture this entity" intent to the lifecycle
//! removal that follows it, and later links the re-emitted entity back to
//! its identity.
//!
//! The intent carries only a connection-scoped [`NetworkId`], so the
//! correlator keeps a cache of network ids seen on marked entities and parks
//! each resolved intent in an [`ExpiringCache`] until the removal arrives or
//! the TTL runs out. An expired intent just means the removal is handled as
//! an ordinary despawn.

use crate::expiring::ExpiringCache;
use crate::registry::{IdentityRecord, IdentityRegistry, RegistryError};
use crate::types::{LifecycleState, NetworkId, OwnerId, Position, StableId};
use crate::world::LiveEntity;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use web_time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCapture {
    pub actor: OwnerId,
    pub stable_id: StableId,
}

pub struct CaptureCorrelator {
    pending: ExpiringCache<NetworkId, PendingCapture>,
    network_ids: Mutex<HashMap<NetworkId, StableId>>,
    match_radius: f64,
}

impl CaptureCorrelator {
    pub fn new(ttl: Duration, match_radius: f64) -> Self {
        Self {
            pending: ExpiringCache::new(ttl),
            network_ids: Mutex::new(HashMap::new()),
            match_radius,
        }
    }

    fn network_ids(&self) -> MutexGuard<'_, HashMap<NetworkId, StableId>> {
        self.network_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn learn(&self, network_id: NetworkId, stable_id: StableId) {
        self.network_ids().insert(network_id, stable_id);
    }

    pub fn forget(&self, network_id: NetworkId) {
        self.network_ids().remove(&network_id);
    }

    pub fn resolve(&self, network_id: NetworkId) -> Option<StableId> {
        self.network_ids().get(&network_id).copied()
    }

    pub fn register_intent(&self, network_id: NetworkId, pending: PendingCapture, now: Instant) {
        log::debug!(
            "capture intent {} -> {} by {}",
            network_id,
            pending.stable_id,
            pending.actor
        );
        self.pending.insert_at(network_id, pending, now);
    }

    pub fn take_pending(&self, network_id: NetworkId, now: Instant) -> Option<PendingCapture> {
        self.pending.take_at(&network_id, now)
    }

    pub fn has_pending_for(&self, stable_id: StableId, now: Instant) -> bool {
        self.pending
            .any_at(now, |_, pending| pending.stable_id == stable_id)
    }

    pub fn sweep(&self, now: Instant) -> usize {
        self.pending.sweep_at(now)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consumes a pending intent for the removed entity and marks its record
    /// captured. Returns the capturing actor, or `None` when no live intent
    /// matches and the removal should be treated as a despawn.
    pub fn on_removed(
        &self,
        registry: &IdentityRegistry,
        network_id: Option<NetworkId>,
        stable_id: StableId,
        now: Instant,
    ) -> Result<Option<OwnerId>, RegistryError> {
        let Some(network_id) = network_id else {
            return Ok(None);
        };
        let Some(pending) = self.take_pending(network_id, now) else {
            return Ok(None);
        };
        if pending.stable_id != stable_id {
            log::debug!(
                "capture intent for {} does not match removed {}",
                pending.stable_id,
                stable_id
            );
            return Ok(None);
        }
        registry.mark_captured(stable_id, pending.actor)?;
        Ok(Some(pending.actor))
    }

    /// Picks the captured identity a freshly released entity most likely
    /// belongs to.
    ///
    /// Preference: captured by the releasing user and recorded nearby, then
    /// captured by that user anywhere (oldest capture first), then any
    /// same-kind capture nearby. The kind-only tiers are best-effort: two
    /// same-kind captures by one user in quick succession can be swapped.
    pub fn match_release(
        &self,
        registry: &IdentityRegistry,
        entity: &LiveEntity,
        by: OwnerId,
    ) -> Option<StableId> {
        let candidates: Vec<IdentityRecord> = registry
            .records_in_state(LifecycleState::Captured)
            .into_iter()
            .filter(|record| record.kind_matches(entity.kind.as_ref()))
            .collect();
        let radius2 = self.match_radius * self.match_radius;
        let mine = || {
            candidates
                .iter()
                .filter(move |record| record.captured_by == Some(by))
        };

        if let Some(record) = nearest(mine(), &entity.position, radius2) {
            return Some(record.stable_id);
        }
        if let Some(record) = mine().min_by_key(|record| record.updated_at_ms) {
            return Some(record.stable_id);
        }
        nearest(candidates.iter(), &entity.position, radius2).map(|record| record.stable_id)
    }
}

fn nearest<'a>(
    records: impl Iterator<Item = &'a IdentityRecord>,
    target: &Position,
    radius2: f64,
) -> Option<&'a IdentityRecord> {
    records
        .filter_map(|record| {
            record
                .last_position
                .distance2(target)
                .filter(|d2| *d2 <= radius2)
                .map(|d2| (d2, record))
        })
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
        .map(|(_, record)| record)
}
