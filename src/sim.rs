//! In-memory world engine.
//!
//! Every world runs on its own worker thread fed by an mpsc queue, so tasks
//! handed to [`WorldEngine::execute`] run asynchronously and strictly in
//! submission order per world. Used by the demo binary and the tests.

use crate::types::{EntityKind, NetworkId, Position, StableId, TransientRef};
use crate::world::{
    AddedEntity, AdditionSource, IdentityMarker, LiveEntity, RemovalCause, RemovedEntity,
    WorldContext, WorldEngine, WorldTask,
};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

pub struct SimWorld {
    name: String,
    entities: BTreeMap<TransientRef, LiveEntity>,
    observers: Vec<Position>,
    next_transient: Arc<AtomicU64>,
    next_network_id: u32,
}

impl SimWorld {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_counter(name, Arc::new(AtomicU64::new(1)))
    }

    fn with_counter(name: impl Into<String>, next_transient: Arc<AtomicU64>) -> Self {
        Self {
            name: name.into(),
            entities: BTreeMap::new(),
            observers: Vec::new(),
            next_transient,
            next_network_id: 1,
        }
    }

    fn insert(
        &mut self,
        kind: Option<EntityKind>,
        at: Position,
        marker: Option<IdentityMarker>,
    ) -> LiveEntity {
        let transient = TransientRef(self.next_transient.fetch_add(1, Ordering::Relaxed));
        let network_id = NetworkId(self.next_network_id);
        self.next_network_id = self.next_network_id.wrapping_add(1);
        let entity = LiveEntity {
            transient,
            network_id: Some(network_id),
            kind,
            position: Position { world: self.name.clone(), ..at },
            marker,
        };
        self.entities.insert(transient, entity.clone());
        entity
    }

    /// Adds an unmarked entity without going through the tether hooks.
    pub fn spawn_wild(&mut self, kind: &str, at: Position) -> LiveEntity {
        self.insert(Some(EntityKind::from(kind)), at, None)
    }

    /// Adds an entity and describes the addition the way an engine callback
    /// would report it.
    pub fn emit(
        &mut self,
        kind: Option<EntityKind>,
        at: Position,
        marker: Option<IdentityMarker>,
        source: AdditionSource,
    ) -> AddedEntity {
        AddedEntity {
            entity: self.insert(kind, at, marker),
            source,
        }
    }

    /// Removes an entity and describes the removal for the lifecycle hooks.
    pub fn take(&mut self, transient: TransientRef, cause: RemovalCause) -> Option<RemovedEntity> {
        let entity = self.entities.remove(&transient)?;
        Some(RemovedEntity {
            transient: entity.transient,
            network_id: entity.network_id,
            kind: entity.kind,
            position: entity.position,
            marker: entity.marker,
            cause,
        })
    }

    pub fn move_to(&mut self, transient: TransientRef, position: Position) -> bool {
        match self.entities.get_mut(&transient) {
            Some(entity) => {
                entity.position = Position { world: self.name.clone(), ..position };
                true
            }
            None => false,
        }
    }

    /// Another world sharing this one's transient id counter, as worlds of
    /// one engine do.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::with_counter(name, Arc::clone(&self.next_transient))
    }

    pub fn add_observer(&mut self, observer: Position) {
        self.observers.push(observer);
    }

    pub fn entities(&self) -> Vec<LiveEntity> {
        self.entities.values().cloned().collect()
    }

    pub fn count_marked(&self, stable_id: StableId) -> usize {
        self.entities
            .values()
            .filter(|entity| {
                entity
                    .marker
                    .as_ref()
                    .map_or(false, |marker| marker.stable_id == stable_id)
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl WorldContext for SimWorld {
    fn world(&self) -> &str {
        &self.name
    }

    fn marked_entities(&self) -> Vec<LiveEntity> {
        self.entities
            .values()
            .filter(|entity| entity.marker.is_some())
            .cloned()
            .collect()
    }

    fn entity(&self, transient: TransientRef) -> Option<LiveEntity> {
        self.entities.get(&transient).cloned()
    }

    fn find_by_network_id(&self, network_id: NetworkId) -> Option<LiveEntity> {
        self.entities
            .values()
            .find(|entity| entity.network_id == Some(network_id))
            .cloned()
    }

    fn observers(&self) -> Vec<Position> {
        self.observers.clone()
    }

    fn spawn(
        &mut self,
        kind: Option<&EntityKind>,
        at: &Position,
        marker: &IdentityMarker,
    ) -> Option<TransientRef> {
        if at.world != self.name {
            return None;
        }
        let entity = self.insert(kind.cloned(), at.clone(), Some(marker.clone()));
        Some(entity.transient)
    }

    fn remove(&mut self, transient: TransientRef) -> bool {
        self.entities.remove(&transient).is_some()
    }

    fn set_marker(&mut self, transient: TransientRef, marker: Option<&IdentityMarker>) -> bool {
        match self.entities.get_mut(&transient) {
            Some(entity) => {
                entity.marker = marker.cloned();
                true
            }
            None => false,
        }
    }
}

type Job = Box<dyn FnOnce(&mut SimWorld) + Send + 'static>;

struct WorldWorker {
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

pub struct SimEngine {
    workers: Mutex<BTreeMap<String, WorldWorker>>,
    next_transient: Arc<AtomicU64>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            next_transient: Arc::new(AtomicU64::new(1)),
        }
    }

    fn workers(&self) -> MutexGuard<'_, BTreeMap<String, WorldWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_world(&self, name: &str) -> io::Result<()> {
        let mut workers = self.workers();
        if workers.contains_key(name) {
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let mut world = SimWorld::with_counter(name, Arc::clone(&self.next_transient));
        let handle = thread::Builder::new()
            .name(format!("sim-{name}"))
            .spawn(move || {
                for job in receiver {
                    job(&mut world);
                }
            })?;
        workers.insert(name.to_string(), WorldWorker { sender, handle });
        Ok(())
    }

    fn submit(&self, world: &str, job: Job) -> bool {
        match self.workers().get(world) {
            Some(worker) => worker.sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Runs `f` on the world's thread and waits for the result. Must not be
    /// called from inside a task running on that same world.
    pub fn run<R, F>(&self, world: &str, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SimWorld) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |world: &mut SimWorld| {
            let _ = tx.send(f(world));
        });
        if !self.submit(world, job) {
            return None;
        }
        rx.recv().ok()
    }

    /// Waits until every task queued on `world` so far has run.
    pub fn flush(&self, world: &str) -> bool {
        self.run(world, |_| ()).is_some()
    }

    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers());
        for (name, worker) in workers {
            drop(worker.sender);
            if worker.handle.join().is_err() {
                log::warn!("sim world {} worker panicked", name);
            }
        }
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorldEngine for SimEngine {
    fn worlds(&self) -> Vec<String> {
        self.workers().keys().cloned().collect()
    }

    fn execute(&self, world: &str, task: WorldTask) -> bool {
        self.submit(
            world,
            Box::new(move |world: &mut SimWorld| task(world as &mut dyn WorldContext)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OwnerId;
    use uuid::Uuid;

    fn marker() -> IdentityMarker {
        IdentityMarker {
            stable_id: StableId(Uuid::new_v4()),
            owner: OwnerId(Uuid::new_v4()),
            name: Some("Daisy".to_string()),
        }
    }

    #[test]
    fn spawned_entities_carry_marker_and_world() {
        let mut world = SimWorld::new("overworld");
        let tag = marker();
        let at = Position::new("elsewhere", 1.0, 2.0, 3.0, 0.0);
        assert_eq!(world.spawn(None, &at, &tag), None);

        let at = Position::new("overworld", 1.0, 2.0, 3.0, 0.0);
        let transient = world.spawn(Some(&EntityKind::from("Cow")), &at, &tag).expect("spawn");
        assert_eq!(world.count_marked(tag.stable_id), 1);
        assert_eq!(world.marked_entities().len(), 1);
        assert!(world.set_marker(transient, None));
        assert!(world.marked_entities().is_empty());
    }

    #[test]
    fn execute_runs_tasks_in_order_on_the_world_thread() {
        let engine = SimEngine::new();
        engine.add_world("overworld").expect("world");
        assert_eq!(engine.worlds(), vec!["overworld".to_string()]);
        assert!(!engine.execute("nether", Box::new(|_: &mut dyn WorldContext| {})));

        let scheduled = engine.execute(
            "overworld",
            Box::new(|ctx: &mut dyn WorldContext| {
                let tag = IdentityMarker {
                    stable_id: StableId(Uuid::new_v4()),
                    owner: OwnerId(Uuid::new_v4()),
                    name: None,
                };
                let at = Position::new("overworld", 0.0, 64.0, 0.0, 0.0);
                ctx.spawn(None, &at, &tag);
            }),
        );
        assert!(scheduled);
        let count = engine.run("overworld", |world| world.len());
        assert_eq!(count, Some(1));
    }

    #[test]
    fn transients_are_unique_across_worlds() {
        let engine = SimEngine::new();
        engine.add_world("a").expect("world");
        engine.add_world("b").expect("world");
        let at = Position::new("a", 0.0, 0.0, 0.0, 0.0);
        let first = engine
            .run("a", move |world| world.spawn_wild("Cow", at).transient)
            .expect("a");
        let at = Position::new("b", 0.0, 0.0, 0.0, 0.0);
        let second = engine
            .run("b", move |world| world.spawn_wild("Cow", at).transient)
            .expect("b");
        assert_ne!(first, second);
    }
}
