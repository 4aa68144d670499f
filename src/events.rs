use crate::types::{BlockPos, OwnerId, Position, StableId, TransientRef};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, PartialEq)]
pub enum TetherEvent {
    Claimed {
        stable_id: StableId,
        owner: OwnerId,
        transient: TransientRef,
    },
    Released {
        stable_id: StableId,
        owner: OwnerId,
    },
    Relinked {
        stable_id: StableId,
        previous: Option<TransientRef>,
        transient: TransientRef,
    },
    PositionUpdated {
        stable_id: StableId,
        position: Position,
    },
    Despawned {
        stable_id: StableId,
        position: Position,
    },
    Captured {
        stable_id: StableId,
        by: OwnerId,
    },
    Stored {
        stable_id: StableId,
        container: BlockPos,
    },
    Died {
        stable_id: StableId,
    },
}

impl TetherEvent {
    pub fn stable_id(&self) -> StableId {
        match self {
            TetherEvent::Claimed { stable_id, .. }
            | TetherEvent::Released { stable_id, .. }
            | TetherEvent::Relinked { stable_id, .. }
            | TetherEvent::PositionUpdated { stable_id, .. }
            | TetherEvent::Despawned { stable_id, .. }
            | TetherEvent::Captured { stable_id, .. }
            | TetherEvent::Stored { stable_id, .. }
            | TetherEvent::Died { stable_id } => *stable_id,
        }
    }
}

/// Fan-out channel for lifecycle events. Subscribers that dropped their
/// receiver are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<TetherEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::Sender<TetherEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TetherEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: TetherEvent) {
        log::trace!("event {:?}", event);
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}
