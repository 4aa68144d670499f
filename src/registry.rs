//! Dual-indexed store of claimed identities.
//!
//! Records are keyed permanently by [`StableId`]; a second index maps the
//! transient engine handle back to the record while the entity is live. Both
//! indices change under one lock, so a transient handle is never bound to
//! two records. The record map is copy-on-write: [`IdentityRegistry::snapshot`]
//! is a reference copy, and the next write clones the map only if a snapshot
//! is still held.

use crate::types::{
    kinds_match, now_unix_ms, BlockPos, EntityKind, GrowthState, LifecycleState, OwnerId,
    Position, StableId, TransientRef,
};
use crate::world::IdentityMarker;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

pub type RegistrySnapshot = Arc<BTreeMap<StableId, IdentityRecord>>;

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityRecord {
    pub stable_id: StableId,
    pub transient: Option<TransientRef>,
    pub owner: OwnerId,
    pub name: Option<String>,
    pub kind: Option<EntityKind>,
    pub state: LifecycleState,
    pub last_position: Position,
    pub growth: GrowthState,
    pub captured_by: Option<OwnerId>,
    pub container: Option<BlockPos>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl IdentityRecord {
    pub fn marker(&self) -> IdentityMarker {
        IdentityMarker {
            stable_id: self.stable_id,
            owner: self.owner,
            name: self.name.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.transient.is_some()
    }

    pub fn kind_matches(&self, kind: Option<&EntityKind>) -> bool {
        kinds_match(self.kind.as_ref(), kind)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no identity record for {0}")]
    UnknownIdentity(StableId),
    #[error("no live entity for {0}")]
    UnknownTransient(TransientRef),
    #[error("identity {0} is dead")]
    Terminal(StableId),
    #[error("transient {transient} is already bound to {holder}")]
    TransientInUse {
        transient: TransientRef,
        holder: StableId,
    },
    #[error("identity {stable_id} cannot go from {from} to {to}")]
    InvalidTransition {
        stable_id: StableId,
        from: LifecycleState,
        to: LifecycleState,
    },
}

#[derive(Default)]
struct RegistryInner {
    records: RegistrySnapshot,
    by_transient: HashMap<TransientRef, StableId>,
}

impl RegistryInner {
    fn records_mut(&mut self) -> &mut BTreeMap<StableId, IdentityRecord> {
        Arc::make_mut(&mut self.records)
    }

    fn unbind(&mut self, stable_id: StableId) {
        let Some(record) = self.records_mut().get_mut(&stable_id) else {
            return;
        };
        if let Some(transient) = record.transient.take() {
            self.by_transient.remove(&transient);
        }
    }
}

#[derive(Default)]
pub struct IdentityRegistry {
    inner: RwLock<RegistryInner>,
    dirty: AtomicBool,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Claims the live entity behind `transient`. If it is already claimed the
    /// existing record is returned unchanged.
    pub fn claim(
        &self,
        transient: TransientRef,
        owner: OwnerId,
        name: Option<String>,
        kind: Option<EntityKind>,
        position: Position,
        growth: GrowthState,
    ) -> IdentityRecord {
        let mut guard = self.write();
        if let Some(existing) = guard
            .by_transient
            .get(&transient)
            .and_then(|stable_id| guard.records.get(stable_id))
        {
            return existing.clone();
        }

        let now_ms = now_unix_ms();
        let record = IdentityRecord {
            stable_id: StableId::fresh(),
            transient: Some(transient),
            owner,
            name,
            kind,
            state: LifecycleState::Active,
            last_position: position,
            growth,
            captured_by: None,
            container: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        guard.by_transient.insert(transient, record.stable_id);
        guard.records_mut().insert(record.stable_id, record.clone());
        drop(guard);
        self.touch();
        record
    }

    /// Removes the record if `requester` owns it.
    pub fn release(&self, stable_id: StableId, requester: OwnerId) -> bool {
        self.release_record(stable_id, requester).is_some()
    }

    /// Like [`IdentityRegistry::release`] but hands back the removed record.
    pub fn release_record(
        &self,
        stable_id: StableId,
        requester: OwnerId,
    ) -> Option<IdentityRecord> {
        let mut guard = self.write();
        let owner = guard.records.get(&stable_id)?.owner;
        if owner != requester {
            return None;
        }
        let record = guard.records_mut().remove(&stable_id)?;
        if let Some(transient) = record.transient {
            guard.by_transient.remove(&transient);
        }
        drop(guard);
        self.touch();
        Some(record)
    }

    /// Binds `stable_id` to a new live entity and makes it active again.
    /// Returns the transient handle it was bound to before, if any.
    pub fn relink(
        &self,
        stable_id: StableId,
        transient: TransientRef,
    ) -> Result<Option<TransientRef>, RegistryError> {
        let mut guard = self.write();
        let record = guard
            .records
            .get(&stable_id)
            .ok_or(RegistryError::UnknownIdentity(stable_id))?;
        if record.state.is_terminal() {
            return Err(RegistryError::Terminal(stable_id));
        }
        if let Some(&holder) = guard.by_transient.get(&transient) {
            if holder != stable_id {
                return Err(RegistryError::TransientInUse { transient, holder });
            }
        }

        let previous = record.transient;
        if let Some(previous) = previous {
            guard.by_transient.remove(&previous);
        }
        guard.by_transient.insert(transient, stable_id);
        if let Some(record) = guard.records_mut().get_mut(&stable_id) {
            record.transient = Some(transient);
            record.state = LifecycleState::Active;
            record.captured_by = None;
            record.container = None;
            record.updated_at_ms = now_unix_ms();
        }
        drop(guard);
        self.touch();
        Ok(previous)
    }

    /// Moves `stable_id` to `next`, dropping its transient binding. Returns
    /// whether the state actually changed.
    fn transition(
        &self,
        stable_id: StableId,
        next: LifecycleState,
        apply: impl FnOnce(&mut IdentityRecord),
    ) -> Result<bool, RegistryError> {
        let mut guard = self.write();
        let record = guard
            .records
            .get(&stable_id)
            .ok_or(RegistryError::UnknownIdentity(stable_id))?;
        let from = record.state;
        if from.is_terminal() {
            return match next {
                LifecycleState::Dead => Ok(false),
                _ => Err(RegistryError::Terminal(stable_id)),
            };
        }
        if !from.allows(next) {
            return Err(RegistryError::InvalidTransition {
                stable_id,
                from,
                to: next,
            });
        }

        guard.unbind(stable_id);
        if let Some(record) = guard.records_mut().get_mut(&stable_id) {
            record.state = next;
            apply(record);
            record.updated_at_ms = now_unix_ms();
        }
        drop(guard);
        self.touch();
        Ok(from != next)
    }

    pub fn mark_despawned(
        &self,
        stable_id: StableId,
        position: Option<Position>,
    ) -> Result<bool, RegistryError> {
        self.transition(stable_id, LifecycleState::Despawned, |record| {
            if let Some(position) = position {
                record.last_position = position;
            }
        })
    }

    pub fn mark_captured(&self, stable_id: StableId, by: OwnerId) -> Result<bool, RegistryError> {
        self.transition(stable_id, LifecycleState::Captured, |record| {
            record.captured_by = Some(by);
            record.container = None;
        })
    }

    pub fn mark_stored(
        &self,
        stable_id: StableId,
        container: BlockPos,
    ) -> Result<bool, RegistryError> {
        self.transition(stable_id, LifecycleState::Stored, |record| {
            record.last_position = container.center();
            record.container = Some(container);
            record.captured_by = None;
        })
    }

    /// Irreversible.
    pub fn mark_dead(&self, stable_id: StableId) -> Result<bool, RegistryError> {
        self.transition(stable_id, LifecycleState::Dead, |record| {
            record.captured_by = None;
            record.container = None;
        })
    }

    pub fn update_growth_state(
        &self,
        stable_id: StableId,
        growth: GrowthState,
    ) -> Result<(), RegistryError> {
        let mut guard = self.write();
        let record = guard
            .records_mut()
            .get_mut(&stable_id)
            .ok_or(RegistryError::UnknownIdentity(stable_id))?;
        if record.state.is_terminal() {
            return Err(RegistryError::Terminal(stable_id));
        }
        record.growth = growth;
        record.updated_at_ms = now_unix_ms();
        drop(guard);
        self.touch();
        Ok(())
    }

    /// Records where a live entity currently is. Returns whether it moved.
    pub fn update_position(
        &self,
        stable_id: StableId,
        position: Position,
    ) -> Result<bool, RegistryError> {
        let mut guard = self.write();
        let current = guard
            .records
            .get(&stable_id)
            .ok_or(RegistryError::UnknownIdentity(stable_id))?;
        if current.last_position == position {
            return Ok(false);
        }
        if let Some(record) = guard.records_mut().get_mut(&stable_id) {
            record.last_position = position;
        }
        drop(guard);
        self.touch();
        Ok(true)
    }

    pub fn get(&self, stable_id: StableId) -> Option<IdentityRecord> {
        self.read().records.get(&stable_id).cloned()
    }

    pub fn by_transient(&self, transient: TransientRef) -> Option<IdentityRecord> {
        let guard = self.read();
        let stable_id = guard.by_transient.get(&transient)?;
        guard.records.get(stable_id).cloned()
    }

    pub fn records_in_world(&self, world: &str) -> Vec<IdentityRecord> {
        self.read()
            .records
            .values()
            .filter(|record| record.last_position.world == world)
            .cloned()
            .collect()
    }

    pub fn records_in_state(&self, state: LifecycleState) -> Vec<IdentityRecord> {
        self.read()
            .records
            .values()
            .filter(|record| record.state == state)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        Arc::clone(&self.read().records)
    }

    /// Replaces the whole registry with persisted records. Transient handles
    /// are dropped; they are meaningless after a restart.
    pub fn restore(&self, records: impl IntoIterator<Item = IdentityRecord>) {
        let mut map = BTreeMap::new();
        for mut record in records {
            record.transient = None;
            map.insert(record.stable_id, record);
        }
        let mut guard = self.write();
        guard.records = Arc::new(map);
        guard.by_transient.clear();
        drop(guard);
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty flag, returning its previous value.
    pub fn mark_clean(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn owner() -> OwnerId {
        OwnerId(Uuid::new_v4())
    }

    fn spot() -> Position {
        Position::new("overworld", 10.0, 64.0, -3.0, 90.0)
    }

    fn claim(registry: &IdentityRegistry, transient: u64, owner: OwnerId) -> IdentityRecord {
        registry.claim(
            TransientRef(transient),
            owner,
            Some("Bessie".to_string()),
            Some(EntityKind::from("Cow")),
            spot(),
            GrowthState::default(),
        )
    }

    fn assert_bindings_consistent(registry: &IdentityRegistry) {
        let guard = registry.read();
        let mut seen = HashMap::new();
        for record in guard.records.values() {
            if let Some(transient) = record.transient {
                assert!(
                    seen.insert(transient, record.stable_id).is_none(),
                    "transient {transient} bound twice"
                );
                assert_eq!(guard.by_transient.get(&transient), Some(&record.stable_id));
            }
        }
        assert_eq!(seen.len(), guard.by_transient.len());
    }

    #[test]
    fn claiming_the_same_transient_twice_returns_existing_record() {
        let registry = IdentityRegistry::new();
        let first = claim(&registry, 1, owner());
        let second = claim(&registry, 1, owner());
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_dirty());
    }

    #[test]
    fn release_requires_the_owner() {
        let registry = IdentityRegistry::new();
        let alice = owner();
        let record = claim(&registry, 1, alice);
        assert!(!registry.release(record.stable_id, owner()));
        assert!(registry.release(record.stable_id, alice));
        assert!(registry.get(record.stable_id).is_none());
        assert!(registry.by_transient(TransientRef(1)).is_none());
    }

    #[test]
    fn relink_moves_transient_index_and_keeps_identity() {
        let registry = IdentityRegistry::new();
        let record = claim(&registry, 1, owner());
        registry
            .mark_despawned(record.stable_id, None)
            .expect("despawn");
        assert!(registry.by_transient(TransientRef(1)).is_none());

        let previous = registry.relink(record.stable_id, TransientRef(2)).expect("relink");
        assert_eq!(previous, None);
        let relinked = registry.by_transient(TransientRef(2)).expect("bound");
        assert_eq!(relinked.stable_id, record.stable_id);
        assert_eq!(relinked.state, LifecycleState::Active);
        assert_eq!(relinked.owner, record.owner);
        assert_eq!(relinked.name, record.name);
    }

    #[test]
    fn relink_refuses_a_transient_held_by_another_record() {
        let registry = IdentityRegistry::new();
        let a = claim(&registry, 1, owner());
        let b = claim(&registry, 2, owner());
        let err = registry.relink(b.stable_id, TransientRef(1)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::TransientInUse {
                transient: TransientRef(1),
                holder: a.stable_id
            }
        );
        assert_bindings_consistent(&registry);
    }

    #[test]
    fn dead_is_terminal() {
        let registry = IdentityRegistry::new();
        let record = claim(&registry, 1, owner());
        assert_eq!(registry.mark_dead(record.stable_id), Ok(true));
        assert_eq!(registry.mark_dead(record.stable_id), Ok(false));
        assert_eq!(
            registry.relink(record.stable_id, TransientRef(5)),
            Err(RegistryError::Terminal(record.stable_id))
        );
        assert!(registry.mark_despawned(record.stable_id, None).is_err());
        assert!(registry.mark_captured(record.stable_id, owner()).is_err());
        assert!(registry
            .mark_stored(record.stable_id, BlockPos::new("overworld", 0, 0, 0))
            .is_err());
        assert_eq!(
            registry.get(record.stable_id).map(|record| record.state),
            Some(LifecycleState::Dead)
        );
    }

    #[test]
    fn stored_cannot_become_captured() {
        let registry = IdentityRegistry::new();
        let record = claim(&registry, 1, owner());
        let coop = BlockPos::new("overworld", 4, 64, 4);
        assert_eq!(registry.mark_stored(record.stable_id, coop.clone()), Ok(true));
        let stored = registry.get(record.stable_id).expect("record");
        assert_eq!(stored.container, Some(coop));
        assert!(matches!(
            registry.mark_captured(record.stable_id, owner()),
            Err(RegistryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let registry = IdentityRegistry::new();
        let record = claim(&registry, 1, owner());
        let snapshot = registry.snapshot();
        registry
            .update_growth_state(record.stable_id, GrowthState(serde_json::json!({"age": 3})))
            .expect("growth");
        claim(&registry, 2, owner());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&record.stable_id].growth, GrowthState::default());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn restore_drops_transients_and_clears_dirty() {
        let registry = IdentityRegistry::new();
        let record = claim(&registry, 1, owner());
        let restored = IdentityRegistry::new();
        restored.restore(vec![record.clone()]);
        assert!(!restored.is_dirty());
        let loaded = restored.get(record.stable_id).expect("record");
        assert_eq!(loaded.transient, None);
        assert!(restored.by_transient(TransientRef(1)).is_none());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Claim(u64),
        Relink(usize, u64),
        Despawn(usize),
        Kill(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..8).prop_map(Op::Claim),
            (0usize..8, 0u64..8).prop_map(|(i, t)| Op::Relink(i, t)),
            (0usize..8).prop_map(Op::Despawn),
            (0usize..8).prop_map(Op::Kill),
            (0usize..8).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn no_transient_is_ever_bound_twice(ops in proptest::collection::vec(op(), 1..64)) {
            let registry = IdentityRegistry::new();
            let alice = owner();
            let mut ids: Vec<StableId> = Vec::new();
            for op in ops {
                match op {
                    Op::Claim(t) => {
                        let record = claim(&registry, t, alice);
                        if !ids.contains(&record.stable_id) {
                            ids.push(record.stable_id);
                        }
                    }
                    Op::Relink(i, t) => {
                        if let Some(&id) = ids.get(i) {
                            let _ = registry.relink(id, TransientRef(t));
                        }
                    }
                    Op::Despawn(i) => {
                        if let Some(&id) = ids.get(i) {
                            let _ = registry.mark_despawned(id, None);
                        }
                    }
                    Op::Kill(i) => {
                        if let Some(&id) = ids.get(i) {
                            let _ = registry.mark_dead(id);
                        }
                    }
                    Op::Release(i) => {
                        if let Some(&id) = ids.get(i) {
                            registry.release(id, alice);
                        }
                    }
                }
                assert_bindings_consistent(&registry);
            }
        }
    }
}
