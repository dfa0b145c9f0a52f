//! Worker bookkeeping for the dispatcher coordinator.
//!
//! Idle workers are kept most-recently-used first: assignment takes from the
//! front and shrinking retires from the back.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;

pub(crate) type WorkerId = u64;

pub(crate) struct Pool<T> {
    workers: HashMap<WorkerId, mpsc::Sender<T>>,
    idle: VecDeque<WorkerId>,
    next_id: WorkerId,
}

impl<T> Pool<T> {
    pub(crate) fn new() -> Self {
        Self {
            workers: HashMap::new(),
            idle: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Tracks a new idle worker fed through `inbox`.
    pub(crate) fn insert(&mut self, inbox: mpsc::Sender<T>) -> WorkerId {
        self.next_id += 1;
        let id = self.next_id;
        self.workers.insert(id, inbox);
        self.idle.push_back(id);
        id
    }

    /// Removes the most recently parked idle worker from the idle list.
    pub(crate) fn take_idle(&mut self) -> Option<(WorkerId, mpsc::Sender<T>)> {
        while let Some(id) = self.idle.pop_front() {
            if let Some(inbox) = self.workers.get(&id) {
                return Some((id, inbox.clone()));
            }
        }
        None
    }

    /// Returns a worker to the front of the idle list.
    pub(crate) fn park(&mut self, id: WorkerId) {
        if self.workers.contains_key(&id) {
            self.idle.push_front(id);
        }
    }

    pub(crate) fn forget(&mut self, id: WorkerId) {
        self.workers.remove(&id);
        self.idle.retain(|idle| *idle != id);
    }

    /// Stops up to `batch` of the longest-idle workers beyond `keep`.
    /// Dropping a worker's inbox ends it.
    pub(crate) fn retire_idle(&mut self, keep: usize, batch: usize) -> usize {
        let mut retired = 0;
        while self.idle.len() > keep && retired < batch {
            let Some(id) = self.idle.pop_back() else { break };
            self.workers.remove(&id);
            retired += 1;
        }
        retired
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn clear(&mut self) {
        self.workers.clear();
        self.idle.clear();
    }
}
