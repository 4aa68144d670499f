//! The context object that wires the registry, correlator, storage tracker,
//! reconciler and persistence together and routes engine callbacks and
//! protocol signals to them.
//!
//! Lifecycle hooks ([`Tether::on_entity_removed`], [`Tether::on_entity_added`])
//! are called by the engine adapter. The addition hook needs the world's
//! context because it may rewrite markers or remove a duplicate.

use crate::capture::{CaptureCorrelator, PendingCapture};
use crate::config::RuntimeConfig;
use crate::events::{EventBus, TetherEvent};
use crate::persistence::{LoadReport, PersistError, PersistenceEngine, SaveStatus};
use crate::reconcile::RespawnReconciler;
use crate::registry::{IdentityRecord, IdentityRegistry, RegistryError};
use crate::storage::{ParkOutcome, StorageTracker};
use crate::types::{
    BlockPos, GrowthState, LifecycleState, NetworkId, OwnerId, StableId, TransientRef,
};
use crate::world::{
    AddedEntity, AdditionSource, RemovalCause, RemovedEntity, WorldContext, WorldEngine,
};
use std::sync::{mpsc, Arc};
use web_time::Instant;

/// What a removal turned into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    Despawned,
    Captured(OwnerId),
    Stored(BlockPos),
    Died,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentOutcome {
    /// Resolved from the network-id cache and registered immediately.
    Registered(StableId),
    /// A lookup was dispatched onto the world's context.
    Scheduled,
    /// The world is unknown to the engine.
    Unknown,
}

/// The slice of the tether the growth collaborator is allowed to touch.
#[derive(Clone)]
pub struct GrowthHandle {
    registry: Arc<IdentityRegistry>,
    events: Arc<EventBus>,
}

impl GrowthHandle {
    pub fn get_record(&self, stable_id: StableId) -> Option<IdentityRecord> {
        self.registry.get(stable_id)
    }

    pub fn update_growth_state(
        &self,
        stable_id: StableId,
        growth: GrowthState,
    ) -> Result<(), RegistryError> {
        self.registry.update_growth_state(stable_id, growth)
    }

    pub fn live_transient(&self, stable_id: StableId) -> Option<TransientRef> {
        self.registry.get(stable_id).and_then(|record| record.transient)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TetherEvent> {
        self.events.subscribe()
    }
}

pub struct Tether {
    config: RuntimeConfig,
    registry: Arc<IdentityRegistry>,
    persistence: PersistenceEngine,
    capture: Arc<CaptureCorrelator>,
    storage: Arc<StorageTracker>,
    reconciler: Arc<RespawnReconciler>,
    events: Arc<EventBus>,
    engine: Arc<dyn WorldEngine>,
}

impl Tether {
    pub fn new(config: RuntimeConfig, engine: Arc<dyn WorldEngine>) -> Self {
        let registry = Arc::new(IdentityRegistry::new());
        let capture = Arc::new(CaptureCorrelator::new(
            config.capture_ttl(),
            config.capture_match_radius,
        ));
        let storage = Arc::new(StorageTracker::new(
            config.container_hint_ttl(),
            config.proximity_match_radius,
        ));
        let events = Arc::new(EventBus::new());
        let reconciler = Arc::new(RespawnReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&capture),
            Arc::clone(&storage),
            Arc::clone(&events),
            config.respawn_radius,
        ));
        let persistence = PersistenceEngine::new(&config);
        Self {
            config,
            registry,
            persistence,
            capture,
            storage,
            reconciler,
            events,
            engine,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &PersistenceEngine {
        &self.persistence
    }

    pub fn capture(&self) -> &CaptureCorrelator {
        &self.capture
    }

    pub fn storage(&self) -> &StorageTracker {
        &self.storage
    }

    pub fn reconciler(&self) -> &Arc<RespawnReconciler> {
        &self.reconciler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn growth_handle(&self) -> GrowthHandle {
        GrowthHandle {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
        }
    }

    /// Loads persisted identities and opens the startup grace period. Must
    /// run before the first sweep.
    pub fn restore(&self) -> Result<LoadReport, PersistError> {
        let report = self.persistence.load()?;
        self.registry.restore(report.records.iter().cloned());
        let stored = self.storage.rebuild(&self.registry);
        let expected = self
            .registry
            .records_in_state(LifecycleState::Active)
            .into_iter()
            .map(|record| record.stable_id);
        self.reconciler
            .begin_grace(expected, self.config.grace_max(), Instant::now());
        log::info!(
            "restored {} identities ({} stored, {} skipped, {} dropped)",
            report.records.len(),
            stored,
            report.skipped,
            report.dropped
        );
        Ok(report)
    }

    /// Claims the live entity `transient` for `owner` and tags it.
    pub fn claim(
        &self,
        ctx: &mut dyn WorldContext,
        transient: TransientRef,
        owner: OwnerId,
        name: Option<String>,
        growth: GrowthState,
    ) -> Result<IdentityRecord, RegistryError> {
        let entity = ctx
            .entity(transient)
            .ok_or(RegistryError::UnknownTransient(transient))?;
        let record = self.registry.claim(
            transient,
            owner,
            name,
            entity.kind.clone(),
            entity.position.clone(),
            growth,
        );
        ctx.set_marker(transient, Some(&record.marker()));
        if let Some(network_id) = entity.network_id {
            self.capture.learn(network_id, record.stable_id);
        }
        log::info!("claimed {} for {} as {}", transient, record.owner, record.stable_id);
        self.events.emit(TetherEvent::Claimed {
            stable_id: record.stable_id,
            owner: record.owner,
            transient,
        });
        Ok(record)
    }

    /// Releases the identity if `requester` owns it. A live carrier has its
    /// marker stripped on its world's context.
    pub fn release(&self, stable_id: StableId, requester: OwnerId) -> bool {
        let Some(record) = self.registry.release_record(stable_id, requester) else {
            return false;
        };
        self.storage.forget(stable_id);
        if let Some(transient) = record.transient {
            let scheduled = self.engine.execute(
                &record.last_position.world,
                Box::new(move |ctx: &mut dyn WorldContext| {
                    ctx.set_marker(transient, None);
                }),
            );
            if !scheduled {
                log::warn!(
                    "released {} but world {} is gone",
                    stable_id,
                    record.last_position.world
                );
            }
        }
        log::info!("released {}", stable_id);
        self.events.emit(TetherEvent::Released {
            stable_id,
            owner: record.owner,
        });
        true
    }

    fn record_for_removal(&self, removed: &RemovedEntity) -> Option<IdentityRecord> {
        if let Some(record) = self.registry.by_transient(removed.transient) {
            return Some(record);
        }
        // Unbound carriers (after a restart, before the first sweep) still
        // count, but a stray duplicate of a record bound elsewhere does not.
        let marker = removed.marker.as_ref()?;
        self.registry
            .get(marker.stable_id)
            .filter(|record| record.transient.is_none())
    }

    /// Lifecycle hook: a live entity left the simulation.
    pub fn on_entity_removed(
        &self,
        removed: &RemovedEntity,
        now: Instant,
    ) -> Result<Option<RemovalOutcome>, RegistryError> {
        let record = self.record_for_removal(removed);
        if let Some(network_id) = removed.network_id {
            self.capture.forget(network_id);
        }
        let Some(record) = record else {
            return Ok(None);
        };
        if record.state.is_terminal() {
            return Ok(None);
        }
        let stable_id = record.stable_id;
        self.registry
            .update_position(stable_id, removed.position.clone())?;

        let outcome = match &removed.cause {
            RemovalCause::Died => {
                self.registry.mark_dead(stable_id)?;
                self.storage.forget(stable_id);
                RemovalOutcome::Died
            }
            RemovalCause::EnteredContainer(container) => {
                self.enter_container(removed, stable_id, container.clone(), now)?
            }
            RemovalCause::Unloaded | RemovalCause::Discarded => {
                if let Some(actor) =
                    self.capture
                        .on_removed(&self.registry, removed.network_id, stable_id, now)?
                {
                    RemovalOutcome::Captured(actor)
                } else if let Some(container) =
                    self.storage.hinted_container(&removed.position, now)
                {
                    self.enter_container(removed, stable_id, container, now)?
                } else {
                    self.registry
                        .mark_despawned(stable_id, Some(removed.position.clone()))?;
                    RemovalOutcome::Despawned
                }
            }
        };

        log::debug!("{} removed: {:?}", stable_id, outcome);
        self.events.emit(match &outcome {
            RemovalOutcome::Despawned => TetherEvent::Despawned {
                stable_id,
                position: removed.position.clone(),
            },
            RemovalOutcome::Captured(by) => TetherEvent::Captured { stable_id, by: *by },
            RemovalOutcome::Stored(container) => TetherEvent::Stored {
                stable_id,
                container: container.clone(),
            },
            RemovalOutcome::Died => TetherEvent::Died { stable_id },
        });
        Ok(Some(outcome))
    }

    fn enter_container(
        &self,
        removed: &RemovedEntity,
        stable_id: StableId,
        container: BlockPos,
        now: Instant,
    ) -> Result<RemovalOutcome, RegistryError> {
        match self
            .storage
            .park(&self.registry, &self.capture, stable_id, container.clone(), now)?
        {
            ParkOutcome::Stored => Ok(RemovalOutcome::Stored(container)),
            ParkOutcome::AlreadyCaptured => {
                if let Some(actor) =
                    self.capture
                        .on_removed(&self.registry, removed.network_id, stable_id, now)?
                {
                    return Ok(RemovalOutcome::Captured(actor));
                }
                match self.registry.get(stable_id).and_then(|r| r.captured_by) {
                    Some(actor) => Ok(RemovalOutcome::Captured(actor)),
                    None => {
                        self.registry
                            .mark_despawned(stable_id, Some(removed.position.clone()))?;
                        Ok(RemovalOutcome::Despawned)
                    }
                }
            }
        }
    }

    /// Lifecycle hook: an entity entered the simulation. Returns the identity
    /// it was linked to, if any.
    pub fn on_entity_added(
        &self,
        ctx: &mut dyn WorldContext,
        added: &AddedEntity,
    ) -> Result<Option<StableId>, RegistryError> {
        let entity = &added.entity;
        let candidate = match &entity.marker {
            Some(marker) => {
                let Some(record) = self.registry.get(marker.stable_id) else {
                    log::debug!("clearing marker of unknown identity {}", marker.stable_id);
                    ctx.set_marker(entity.transient, None);
                    return Ok(None);
                };
                if record.state.is_terminal() {
                    ctx.set_marker(entity.transient, None);
                    return Ok(None);
                }
                match record.transient {
                    Some(bound) if bound == entity.transient => {
                        return Ok(Some(record.stable_id));
                    }
                    Some(bound) if ctx.entity_exists(bound) => {
                        log::info!(
                            "removing duplicate {} of {} (live as {})",
                            entity.transient,
                            record.stable_id,
                            bound
                        );
                        ctx.remove(entity.transient);
                        return Ok(None);
                    }
                    _ => Some(record.stable_id),
                }
            }
            None => match &added.source {
                AdditionSource::ContainerExit(container) => self
                    .storage
                    .unpark_exact(&self.registry, container, entity.kind.as_ref())
                    .or_else(|| {
                        self.storage.unpark_nearby(
                            &self.registry,
                            &entity.position,
                            entity.kind.as_ref(),
                        )
                    }),
                AdditionSource::Released { by } => {
                    self.capture.match_release(&self.registry, entity, *by)
                }
                AdditionSource::Spawned | AdditionSource::Loaded => None,
            },
        };
        let Some(stable_id) = candidate else {
            return Ok(None);
        };

        let parked_in = self
            .registry
            .get(stable_id)
            .filter(|record| record.state == LifecycleState::Stored)
            .and_then(|record| record.container);
        let was_stored = parked_in.is_some();
        let previous = match self.registry.relink(stable_id, entity.transient) {
            Ok(previous) => previous,
            Err(error) => {
                if let Some(container) = parked_in {
                    self.storage.requeue(container, stable_id);
                }
                return Err(error);
            }
        };
        self.registry
            .update_position(stable_id, entity.position.clone())?;
        if was_stored {
            self.storage.forget(stable_id);
        }
        if let Some(record) = self.registry.get(stable_id) {
            ctx.set_marker(entity.transient, Some(&record.marker()));
        }
        if let Some(network_id) = entity.network_id {
            self.capture.learn(network_id, stable_id);
        }
        self.reconciler.note_rediscovered(stable_id);
        log::debug!("relinked {} to {}", stable_id, entity.transient);
        self.events.emit(TetherEvent::Relinked {
            stable_id,
            previous,
            transient: entity.transient,
        });
        Ok(Some(stable_id))
    }

    /// Protocol signal: `actor` is about to capture entity `network_id`.
    pub fn on_capture_intent(
        &self,
        actor: OwnerId,
        world: &str,
        network_id: NetworkId,
    ) -> IntentOutcome {
        if let Some(stable_id) = self.capture.resolve(network_id) {
            self.capture
                .register_intent(network_id, PendingCapture { actor, stable_id }, Instant::now());
            return IntentOutcome::Registered(stable_id);
        }
        let registry = Arc::clone(&self.registry);
        let capture = Arc::clone(&self.capture);
        let scheduled = self.engine.execute(
            world,
            Box::new(move |ctx: &mut dyn WorldContext| {
                let Some(entity) = ctx.find_by_network_id(network_id) else {
                    return;
                };
                let stable_id = entity
                    .marker
                    .as_ref()
                    .map(|marker| marker.stable_id)
                    .or_else(|| registry.by_transient(entity.transient).map(|r| r.stable_id));
                if let Some(stable_id) = stable_id {
                    capture.learn(network_id, stable_id);
                    capture.register_intent(
                        network_id,
                        PendingCapture { actor, stable_id },
                        Instant::now(),
                    );
                }
            }),
        );
        if scheduled {
            IntentOutcome::Scheduled
        } else {
            IntentOutcome::Unknown
        }
    }

    /// Protocol signal: `actor` opened or used the container at `container`.
    pub fn on_container_interaction(&self, actor: OwnerId, container: BlockPos) {
        self.storage
            .note_container_use(actor, container, Instant::now());
    }

    /// Schedules a sweep of every world. Returns how many were scheduled.
    pub fn request_sweeps(&self) -> usize {
        self.engine
            .worlds()
            .iter()
            .filter(|world| self.reconciler.request_sweep(&*self.engine, world))
            .count()
    }

    /// Drops expired correlation entries and container hints.
    pub fn sweep_correlations(&self, now: Instant) -> usize {
        self.capture.sweep(now) + self.storage.sweep_hints(now)
    }

    pub fn save(&self) -> SaveStatus {
        self.persistence.save(&self.registry)
    }

    pub fn save_if_dirty(&self) -> SaveStatus {
        self.persistence.save_if_dirty(&self.registry)
    }

    pub fn save_sync(&self) -> Result<(), PersistError> {
        self.persistence.save_sync(&self.registry)
    }
}
