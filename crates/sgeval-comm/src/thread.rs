use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

use crate::{check_rank, CommError, Collective, Gatherable};

type Slot = Option<Box<dyn Any + Send>>;

struct Shared {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
}

/// Handle of one worker thread inside an in-process group.
///
/// Values are exchanged by clone through a shared slot table; nothing is
/// serialized.
#[derive(Clone)]
pub struct ThreadCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .finish()
    }
}

/// Creates one handle per rank; hand each to its own worker thread.
pub fn thread_group(world_size: usize) -> Result<Vec<ThreadCollective>, CommError> {
    check_rank(0, world_size)?;
    let shared = Arc::new(Shared {
        world_size,
        barrier: Barrier::new(world_size),
        slots: Mutex::new((0..world_size).map(|_| None).collect()),
    });
    Ok((0..world_size)
        .map(|rank| ThreadCollective {
            rank,
            shared: shared.clone(),
        })
        .collect())
}

impl ThreadCollective {
    fn collect<T: Gatherable>(&self) -> Result<Vec<T>, CommError> {
        let slots = self.shared.slots.lock().map_err(|_| CommError::Poisoned)?;
        slots
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.as_ref()
                    .and_then(|v| v.downcast_ref::<T>())
                    .cloned()
                    .ok_or(CommError::TypeMismatch { rank })
            })
            .collect()
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_gather<T: Gatherable>(&self, value: T) -> Result<Vec<T>, CommError> {
        let published = match self.shared.slots.lock() {
            Ok(mut slots) => {
                slots[self.rank] = Some(Box::new(value));
                Ok(())
            }
            Err(_) => Err(CommError::Poisoned),
        };

        // Every rank has published once this returns.
        self.shared.barrier.wait();
        let gathered = published.and_then(|()| self.collect::<T>());

        // Nobody may overwrite a slot until every rank has read the table.
        self.shared.barrier.wait();
        if let Ok(mut slots) = self.shared.slots.lock() {
            slots[self.rank] = None;
        }
        gathered
    }
}
