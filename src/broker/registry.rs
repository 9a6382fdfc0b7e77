use std::collections::VecDeque;

use hashbrown::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::net::Address;

struct Worker {
    expiry: Instant,
}

/// The live worker pool, ordered by how recently each worker became ready.
/// The least recently ready worker is at the front and is handed out first,
/// so load spreads round-robin while every worker is busy.
pub struct WorkerRegistry {
    workers: HashMap<Address, Worker>,
    order: VecDeque<Address>,
    liveness_window: Duration,
}

impl WorkerRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        WorkerRegistry {
            workers: HashMap::new(),
            order: VecDeque::new(),
            liveness_window,
        }
    }

    /// Registers or refreshes a worker and moves it to the back of the queue.
    pub fn ready(&mut self, address: Address) {
        let expiry = Instant::now() + self.liveness_window;
        if self
            .workers
            .insert(address.clone(), Worker { expiry })
            .is_some()
        {
            self.order.retain(|queued| queued != &address);
        } else {
            debug!(worker = %address, "worker joined the pool");
        }
        self.order.push_back(address);
    }

    /// Evicts every worker whose expiry has passed. Returns how many went.
    pub fn purge(&mut self) -> usize {
        let now = Instant::now();
        let before = self.order.len();
        let workers = &mut self.workers;
        self.order.retain(|address| {
            let expired = workers.get(address).map_or(true, |w| now > w.expiry);
            if expired {
                warn!(worker = %address, "idle worker expired");
                workers.remove(address);
            }
            !expired
        });
        before - self.order.len()
    }

    /// Takes the least recently ready worker out of the pool.
    pub fn next(&mut self) -> Option<Address> {
        let address = self.order.pop_front()?;
        self.workers.remove(&address);
        Some(address)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.workers.contains_key(address)
    }

    /// Registered workers, least recently ready first.
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.order.iter()
    }
}
