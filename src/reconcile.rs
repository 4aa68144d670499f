//! Periodic per-world reconciliation.
//!
//! A sweep runs on the world's own context. It indexes every marked entity,
//! relinks records to what it finds, removes duplicate carriers of one
//! identity, marks vanished records despawned and finally respawns despawned
//! records that have an observer nearby.

use crate::capture::CaptureCorrelator;
use crate::events::{EventBus, TetherEvent};
use crate::registry::{IdentityRecord, IdentityRegistry};
use crate::storage::StorageTracker;
use crate::types::{LifecycleState, Position, StableId};
use crate::world::{LiveEntity, WorldContext, WorldEngine};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use web_time::Instant;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub world: String,
    pub relinked: usize,
    pub despawned: usize,
    pub respawned: usize,
    pub duplicates_removed: usize,
    pub markers_cleared: usize,
    pub positions_updated: usize,
    /// Missing records left alone because the startup grace period is active.
    pub deferred: usize,
}

impl SweepReport {
    fn new(world: &str) -> Self {
        Self {
            world: world.to_string(),
            ..Self::default()
        }
    }

    pub fn changed_anything(&self) -> bool {
        self.relinked
            + self.despawned
            + self.respawned
            + self.duplicates_removed
            + self.markers_cleared
            > 0
    }
}

struct GracePeriod {
    started: Instant,
    max: Duration,
    pending: HashSet<StableId>,
}

pub struct RespawnReconciler {
    registry: Arc<IdentityRegistry>,
    capture: Arc<CaptureCorrelator>,
    storage: Arc<StorageTracker>,
    events: Arc<EventBus>,
    respawn_radius: f64,
    grace: Mutex<Option<GracePeriod>>,
    in_progress: Mutex<HashSet<String>>,
}

/// Clears the world's in-progress entry when the scheduled sweep finishes
/// or is dropped unrun.
struct SweepGuard {
    reconciler: Arc<RespawnReconciler>,
    world: String,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.reconciler.in_progress().remove(&self.world);
    }
}

impl RespawnReconciler {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        capture: Arc<CaptureCorrelator>,
        storage: Arc<StorageTracker>,
        events: Arc<EventBus>,
        respawn_radius: f64,
    ) -> Self {
        Self {
            registry,
            capture,
            storage,
            events,
            respawn_radius,
            grace: Mutex::new(None),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    fn grace(&self) -> MutexGuard<'_, Option<GracePeriod>> {
        self.grace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_progress(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Suppresses despawn handling until every id in `expected` was seen
    /// again or `max` elapsed.
    pub fn begin_grace(
        &self,
        expected: impl IntoIterator<Item = StableId>,
        max: Duration,
        now: Instant,
    ) {
        let pending: HashSet<StableId> = expected.into_iter().collect();
        if pending.is_empty() || max.is_zero() {
            *self.grace() = None;
            return;
        }
        log::info!(
            "startup grace: waiting for {} identities, at most {:?}",
            pending.len(),
            max
        );
        *self.grace() = Some(GracePeriod {
            started: now,
            max,
            pending,
        });
    }

    pub fn grace_active(&self, now: Instant) -> bool {
        let mut grace = self.grace();
        let Some(period) = grace.as_ref() else {
            return false;
        };
        if period.pending.is_empty() {
            log::info!("startup grace over: all identities rediscovered");
        } else if now.saturating_duration_since(period.started) >= period.max {
            log::info!(
                "startup grace over: {} identities still missing",
                period.pending.len()
            );
        } else {
            return true;
        }
        *grace = None;
        false
    }

    /// Records that `stable_id` showed up again after a restart.
    pub fn note_rediscovered(&self, stable_id: StableId) {
        if let Some(period) = self.grace().as_mut() {
            period.pending.remove(&stable_id);
        }
    }

    pub fn is_sweeping(&self, world: &str) -> bool {
        self.in_progress().contains(world)
    }

    /// Schedules a sweep of `world` on its context. Returns false when a
    /// sweep of that world is already queued or running, or the world is
    /// unknown to the engine.
    pub fn request_sweep(self: &Arc<Self>, engine: &dyn WorldEngine, world: &str) -> bool {
        if !self.in_progress().insert(world.to_string()) {
            log::debug!("sweep world={} already in progress, skipping", world);
            return false;
        }
        let guard = SweepGuard {
            reconciler: Arc::clone(self),
            world: world.to_string(),
        };
        engine.execute(
            world,
            Box::new(move |ctx: &mut dyn WorldContext| {
                let report = guard.reconciler.sweep(ctx, Instant::now());
                if report.changed_anything() {
                    log::info!(
                        "sweep world={} relinked={} despawned={} respawned={} duplicates={} cleared={}",
                        report.world,
                        report.relinked,
                        report.despawned,
                        report.respawned,
                        report.duplicates_removed,
                        report.markers_cleared
                    );
                } else {
                    log::debug!("sweep world={} deferred={}", report.world, report.deferred);
                }
                drop(guard);
            }),
        )
    }

    pub fn sweep(&self, ctx: &mut dyn WorldContext, now: Instant) -> SweepReport {
        let world = ctx.world().to_string();
        let mut report = SweepReport::new(&world);

        let mut marked: BTreeMap<StableId, Vec<LiveEntity>> = BTreeMap::new();
        for entity in ctx.marked_entities() {
            let Some(stable_id) = entity.marker.as_ref().map(|marker| marker.stable_id) else {
                continue;
            };
            if let Some(network_id) = entity.network_id {
                self.capture.learn(network_id, stable_id);
            }
            marked.entry(stable_id).or_default().push(entity);
        }

        let in_grace = self.grace_active(now);
        for record in self.registry.records_in_world(&world) {
            let found = marked.remove(&record.stable_id).unwrap_or_default();
            if record.state.is_terminal() {
                self.clear_markers(ctx, &found, &mut report);
                continue;
            }
            if !found.is_empty() {
                self.adopt(ctx, &record, found, &mut report);
                continue;
            }
            if record.state != LifecycleState::Active {
                continue;
            }
            if let Some(transient) = record.transient {
                // Bound but unmarked: something stripped the tag.
                if let Some(position) = ctx.position_of(transient) {
                    ctx.set_marker(transient, Some(&record.marker()));
                    self.refresh_position(&record, position, &mut report);
                    continue;
                }
            }
            if in_grace {
                report.deferred += 1;
                continue;
            }
            match self.registry.mark_despawned(record.stable_id, None) {
                Ok(_) => {
                    report.despawned += 1;
                    self.events.emit(TetherEvent::Despawned {
                        stable_id: record.stable_id,
                        position: record.last_position.clone(),
                    });
                }
                Err(error) => log::warn!("sweep: cannot despawn {}: {}", record.stable_id, error),
            }
        }

        // Marked entities whose record lives in another world, or in none.
        for (stable_id, found) in marked {
            match self.registry.get(stable_id) {
                Some(record) if record.state.is_terminal() => {
                    self.clear_markers(ctx, &found, &mut report)
                }
                // Bound to a live carrier elsewhere: these are copies.
                Some(record) if record.transient.is_some() => {
                    self.remove_duplicates(ctx, found, &mut report)
                }
                Some(record) => self.adopt(ctx, &record, found, &mut report),
                None => self.clear_markers(ctx, &found, &mut report),
            }
        }

        if in_grace {
            report.deferred += self
                .registry
                .records_in_world(&world)
                .iter()
                .filter(|record| record.state == LifecycleState::Despawned)
                .count();
        } else {
            self.respawn_near_observers(ctx, &world, &mut report);
        }
        report
    }

    fn remove_duplicates(
        &self,
        ctx: &mut dyn WorldContext,
        entities: Vec<LiveEntity>,
        report: &mut SweepReport,
    ) {
        for entity in entities {
            if ctx.remove(entity.transient) {
                report.duplicates_removed += 1;
                if let Some(network_id) = entity.network_id {
                    self.capture.forget(network_id);
                }
            }
        }
    }

    fn clear_markers(
        &self,
        ctx: &mut dyn WorldContext,
        entities: &[LiveEntity],
        report: &mut SweepReport,
    ) {
        for entity in entities {
            if ctx.set_marker(entity.transient, None) {
                report.markers_cleared += 1;
            }
        }
    }

    /// Keeps one live carrier of `record` and removes the rest. The carrier
    /// already bound to the record wins; otherwise the first one found.
    fn adopt(
        &self,
        ctx: &mut dyn WorldContext,
        record: &IdentityRecord,
        mut found: Vec<LiveEntity>,
        report: &mut SweepReport,
    ) {
        let keep = found
            .iter()
            .position(|entity| Some(entity.transient) == record.transient)
            .unwrap_or(0);
        if keep >= found.len() {
            return;
        }
        let keeper = found.remove(keep);
        self.remove_duplicates(ctx, found, report);

        if record.transient != Some(keeper.transient) || record.state != LifecycleState::Active {
            match self.registry.relink(record.stable_id, keeper.transient) {
                Ok(previous) => {
                    if record.state == LifecycleState::Stored {
                        self.storage.forget(record.stable_id);
                    }
                    report.relinked += 1;
                    self.events.emit(TetherEvent::Relinked {
                        stable_id: record.stable_id,
                        previous,
                        transient: keeper.transient,
                    });
                }
                Err(error) => {
                    log::warn!("sweep: cannot relink {}: {}", record.stable_id, error);
                    return;
                }
            }
        }
        self.note_rediscovered(record.stable_id);
        self.refresh_position(record, keeper.position, report);
    }

    fn refresh_position(
        &self,
        record: &IdentityRecord,
        position: Position,
        report: &mut SweepReport,
    ) {
        if let Ok(true) = self
            .registry
            .update_position(record.stable_id, position.clone())
        {
            report.positions_updated += 1;
            self.events.emit(TetherEvent::PositionUpdated {
                stable_id: record.stable_id,
                position,
            });
        }
    }

    fn respawn_near_observers(
        &self,
        ctx: &mut dyn WorldContext,
        world: &str,
        report: &mut SweepReport,
    ) {
        let observers = ctx.observers();
        if observers.is_empty() {
            return;
        }
        for record in self.registry.records_in_world(world) {
            if record.state != LifecycleState::Despawned {
                continue;
            }
            let near = observers
                .iter()
                .any(|observer| observer.within(&record.last_position, self.respawn_radius));
            if !near {
                continue;
            }
            let Some(transient) =
                ctx.spawn(record.kind.as_ref(), &record.last_position, &record.marker())
            else {
                log::warn!("sweep: world {} refused to respawn {}", world, record.stable_id);
                continue;
            };
            match self.registry.relink(record.stable_id, transient) {
                Ok(previous) => {
                    report.respawned += 1;
                    if let Some(network_id) = ctx.entity(transient).and_then(|e| e.network_id) {
                        self.capture.learn(network_id, record.stable_id);
                    }
                    self.events.emit(TetherEvent::Relinked {
                        stable_id: record.stable_id,
                        previous,
                        transient,
                    });
                }
                Err(error) => {
                    log::warn!("sweep: respawned {} but relink failed: {}", record.stable_id, error);
                    ctx.remove(transient);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEngine, SimWorld};
    use crate::types::{EntityKind, GrowthState, OwnerId, Position};
    use crate::world::{IdentityMarker, RemovalCause};
    use std::sync::mpsc;
    use uuid::Uuid;

    const WORLD: &str = "overworld";

    struct Fixture {
        registry: Arc<IdentityRegistry>,
        events: Arc<EventBus>,
        reconciler: Arc<RespawnReconciler>,
        world: SimWorld,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(IdentityRegistry::new());
        let capture = Arc::new(CaptureCorrelator::new(Duration::from_millis(1500), 16.0));
        let storage = Arc::new(StorageTracker::new(Duration::from_secs(2), 6.0));
        let events = Arc::new(EventBus::new());
        let reconciler = Arc::new(RespawnReconciler::new(
            Arc::clone(&registry),
            capture,
            storage,
            Arc::clone(&events),
            64.0,
        ));
        Fixture {
            registry,
            events,
            reconciler,
            world: SimWorld::new(WORLD),
        }
    }

    fn spot(x: f64) -> Position {
        Position::new(WORLD, x, 64.0, 0.0, 45.0)
    }

    /// Claims a wild cow and tags it the way a claim would.
    fn claimed_cow(f: &mut Fixture, x: f64) -> IdentityRecord {
        let entity = f.world.spawn_wild("Cow", spot(x));
        let record = f.registry.claim(
            entity.transient,
            OwnerId(Uuid::new_v4()),
            Some("Bessie".to_string()),
            entity.kind.clone(),
            entity.position.clone(),
            GrowthState::default(),
        );
        f.world.set_marker(entity.transient, Some(&record.marker()));
        record
    }

    fn drain(rx: &mpsc::Receiver<TetherEvent>) -> Vec<TetherEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn despawned_record_near_observer_respawns_exactly_once() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 5.0);
        let original = record.transient.expect("bound");
        f.world.take(original, RemovalCause::Unloaded);
        f.world.add_observer(spot(20.0));
        let rx = f.events.subscribe();

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.despawned, 1);
        assert_eq!(report.respawned, 1);
        assert_eq!(f.world.count_marked(record.stable_id), 1);

        let relinked = f.registry.get(record.stable_id).expect("record");
        assert_eq!(relinked.state, LifecycleState::Active);
        assert_eq!(relinked.owner, record.owner);
        assert_eq!(relinked.name, record.name);
        assert_ne!(relinked.transient, Some(original));
        let events = drain(&rx);
        assert!(matches!(events[0], TetherEvent::Despawned { .. }));
        assert!(matches!(events[1], TetherEvent::Relinked { previous: None, .. }));

        let second = f.reconciler.sweep(&mut f.world, Instant::now());
        assert!(!second.changed_anything());
        assert_eq!(f.world.count_marked(record.stable_id), 1);
    }

    #[test]
    fn no_respawn_without_a_nearby_observer() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        f.world
            .take(record.transient.expect("bound"), RemovalCause::Unloaded);
        f.world.add_observer(spot(500.0));

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.despawned, 1);
        assert_eq!(report.respawned, 0);
        assert_eq!(
            f.registry.get(record.stable_id).map(|r| r.state),
            Some(LifecycleState::Despawned)
        );
    }

    #[test]
    fn marked_entity_is_relinked_and_duplicates_removed() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        f.registry.mark_despawned(record.stable_id, None).expect("despawn");
        f.world.spawn(None, &spot(1.0), &record.marker()).expect("spawn");
        f.world.spawn(None, &spot(2.0), &record.marker()).expect("spawn");
        assert_eq!(f.world.count_marked(record.stable_id), 3);

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.relinked, 1);
        assert_eq!(report.duplicates_removed, 2);
        assert_eq!(f.world.count_marked(record.stable_id), 1);
        // The oldest carrier is kept.
        let bound = f.registry.get(record.stable_id).and_then(|r| r.transient);
        assert_eq!(bound, record.transient);
    }

    #[test]
    fn bound_carrier_wins_over_duplicates() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        f.world.spawn(None, &spot(1.0), &record.marker()).expect("spawn");

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.relinked, 0);
        assert_eq!(
            f.registry.get(record.stable_id).and_then(|r| r.transient),
            record.transient
        );
    }

    #[test]
    fn dead_and_unknown_markers_are_cleared() {
        let mut f = fixture();
        let dead = claimed_cow(&mut f, 0.0);
        f.registry.mark_dead(dead.stable_id).expect("dead");
        let stray = IdentityMarker {
            stable_id: StableId(Uuid::new_v4()),
            owner: OwnerId(Uuid::new_v4()),
            name: None,
        };
        f.world.spawn(Some(&EntityKind::from("Pig")), &spot(3.0), &stray);

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.markers_cleared, 2);
        assert!(f.world.marked_entities().is_empty());
        assert_eq!(f.world.len(), 2);
    }

    #[test]
    fn grace_period_defers_despawn_until_rediscovered_or_expired() {
        let mut f = fixture();
        let present = claimed_cow(&mut f, 0.0);
        let missing = claimed_cow(&mut f, 10.0);
        f.world
            .take(missing.transient.expect("bound"), RemovalCause::Unloaded);
        // Persisted records come back unbound.
        let records = vec![
            f.registry.get(present.stable_id).expect("present"),
            f.registry.get(missing.stable_id).expect("missing"),
        ];
        f.registry.restore(records);

        let t0 = Instant::now();
        f.reconciler.begin_grace(
            [present.stable_id, missing.stable_id],
            Duration::from_secs(30),
            t0,
        );
        let report = f.reconciler.sweep(&mut f.world, t0);
        assert_eq!(report.relinked, 1);
        assert_eq!(report.deferred, 1);
        assert!(f.reconciler.grace_active(t0));

        let later = t0 + Duration::from_secs(31);
        let report = f.reconciler.sweep(&mut f.world, later);
        assert_eq!(report.despawned, 1);
        assert!(!f.reconciler.grace_active(later));
        assert_eq!(
            f.registry.get(missing.stable_id).map(|r| r.state),
            Some(LifecycleState::Despawned)
        );
    }

    #[test]
    fn grace_period_holds_back_respawns_of_despawned_records() {
        let mut f = fixture();
        let waiting = claimed_cow(&mut f, 500.0);
        let gone = claimed_cow(&mut f, 5.0);
        for record in [&waiting, &gone] {
            f.world
                .take(record.transient.expect("bound"), RemovalCause::Unloaded);
        }
        f.registry.mark_despawned(gone.stable_id, None).expect("despawn");
        let records = vec![
            f.registry.get(waiting.stable_id).expect("waiting"),
            f.registry.get(gone.stable_id).expect("gone"),
        ];
        f.registry.restore(records);
        f.world.add_observer(spot(10.0));

        let t0 = Instant::now();
        f.reconciler
            .begin_grace([waiting.stable_id], Duration::from_secs(30), t0);
        let report = f.reconciler.sweep(&mut f.world, t0);
        assert_eq!(report.respawned, 0);
        assert_eq!(report.deferred, 2);
        assert_eq!(f.world.count_marked(gone.stable_id), 0);
        assert_eq!(
            f.registry.get(gone.stable_id).map(|r| r.state),
            Some(LifecycleState::Despawned)
        );

        let later = t0 + Duration::from_secs(31);
        let report = f.reconciler.sweep(&mut f.world, later);
        assert_eq!(report.despawned, 1);
        assert_eq!(report.respawned, 1);
        assert_eq!(f.world.count_marked(gone.stable_id), 1);
        assert_eq!(f.world.count_marked(waiting.stable_id), 0);
    }

    #[test]
    fn copy_in_another_world_of_a_bound_record_is_removed() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        let original = record.transient;
        let mut elsewhere = f.world.sibling("pasture");
        elsewhere
            .spawn(
                Some(&EntityKind::from("Cow")),
                &Position::new("pasture", 3.0, 64.0, 0.0, 0.0),
                &record.marker(),
            )
            .expect("spawn");

        let report = f.reconciler.sweep(&mut elsewhere, Instant::now());
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.relinked, 0);
        assert_eq!(elsewhere.count_marked(record.stable_id), 0);

        for _ in 0..3 {
            f.reconciler.sweep(&mut elsewhere, Instant::now());
            let home = f.reconciler.sweep(&mut f.world, Instant::now());
            assert_eq!(home.relinked, 0);
            assert_eq!(f.registry.get(record.stable_id).and_then(|r| r.transient), original);
        }
        assert_eq!(f.world.count_marked(record.stable_id), 1);
        assert_eq!(elsewhere.count_marked(record.stable_id), 0);
    }

    #[test]
    fn unbound_record_follows_its_carrier_into_another_world() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        f.world
            .take(record.transient.expect("bound"), RemovalCause::Unloaded);
        f.registry.mark_despawned(record.stable_id, None).expect("despawn");
        let mut elsewhere = f.world.sibling("pasture");
        let carrier = elsewhere
            .spawn(None, &Position::new("pasture", 3.0, 64.0, 0.0, 0.0), &record.marker())
            .expect("spawn");

        let report = f.reconciler.sweep(&mut elsewhere, Instant::now());
        assert_eq!(report.relinked, 1);
        let moved = f.registry.get(record.stable_id).expect("record");
        assert_eq!(moved.transient, Some(carrier));
        assert_eq!(moved.last_position.world, "pasture");
        assert_eq!(moved.state, LifecycleState::Active);
    }

    #[test]
    fn request_sweep_refuses_to_overlap_on_one_world() {
        let f = fixture();
        let engine = SimEngine::new();
        engine.add_world(WORLD).expect("world");
        let (release, hold) = mpsc::channel::<()>();
        assert!(engine.execute(
            WORLD,
            Box::new(move |_: &mut dyn WorldContext| {
                let _ = hold.recv();
            }),
        ));

        assert!(f.reconciler.request_sweep(&engine, WORLD));
        assert!(f.reconciler.is_sweeping(WORLD));
        assert!(!f.reconciler.request_sweep(&engine, WORLD));
        assert!(!f.reconciler.request_sweep(&engine, "nether"));
        assert!(!f.reconciler.is_sweeping("nether"));

        release.send(()).expect("release");
        assert!(engine.flush(WORLD));
        assert!(!f.reconciler.is_sweeping(WORLD));
        assert!(f.reconciler.request_sweep(&engine, WORLD));
    }

    #[test]
    fn grace_ends_once_everything_is_rediscovered() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        let t0 = Instant::now();
        f.reconciler
            .begin_grace([record.stable_id], Duration::from_secs(30), t0);
        f.reconciler.note_rediscovered(record.stable_id);
        assert!(!f.reconciler.grace_active(t0));
    }

    #[test]
    fn parked_records_are_left_alone() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        f.world
            .take(record.transient.expect("bound"), RemovalCause::Unloaded);
        f.registry
            .mark_captured(record.stable_id, OwnerId(Uuid::new_v4()))
            .expect("capture");
        f.world.add_observer(spot(0.0));

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert!(!report.changed_anything());
        assert_eq!(
            f.registry.get(record.stable_id).map(|r| r.state),
            Some(LifecycleState::Captured)
        );
        assert_eq!(f.world.count_marked(record.stable_id), 0);
    }

    #[test]
    fn position_refresh_follows_the_live_entity() {
        let mut f = fixture();
        let record = claimed_cow(&mut f, 0.0);
        let transient = record.transient.expect("bound");
        f.world.move_to(transient, spot(12.0));

        let report = f.reconciler.sweep(&mut f.world, Instant::now());
        assert_eq!(report.positions_updated, 1);
        assert_eq!(
            f.registry.get(record.stable_id).map(|r| r.last_position.x),
            Some(12.0)
        );
        assert_eq!(
            f.registry.by_transient(transient).map(|r| r.stable_id),
            Some(record.stable_id)
        );
    }
}
