//! Per-key job queue.
//!
//! A union is bound while a worker owns it or a worker has been requested
//! for it. At most one worker is bound at a time, which is what keeps jobs
//! of one key sequential.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::job::Job;

pub(crate) struct JobUnion<P, O> {
    key: String,
    state: Mutex<UnionState<P, O>>,
}

struct UnionState<P, O> {
    jobs: VecDeque<Job<P, O>>,
    bound: bool,
    last_active: Instant,
}

impl<P, O> JobUnion<P, O> {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(UnionState {
                jobs: VecDeque::new(),
                bound: false,
                last_active: Instant::now(),
            }),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Appends `job`; returns true when the union was unbound and now needs
    /// a worker.
    pub(crate) fn push(&self, job: Job<P, O>) -> bool {
        let mut state = self.lock();
        state.jobs.push_back(job);
        state.last_active = Instant::now();
        if state.bound {
            return false;
        }
        state.bound = true;
        true
    }

    pub(crate) fn pop(&self) -> Option<Job<P, O>> {
        self.lock().jobs.pop_front()
    }

    /// Unbinds the union if it has no queued jobs. Returns false when jobs
    /// arrived and the caller must keep draining.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.lock();
        if !state.jobs.is_empty() {
            return false;
        }
        state.bound = false;
        state.last_active = Instant::now();
        true
    }

    /// Unbinds the union and hands back whatever was still queued.
    pub(crate) fn abandon(&self) -> Vec<Job<P, O>> {
        let mut state = self.lock();
        state.bound = false;
        state.jobs.drain(..).collect()
    }

    /// Empty and unbound for at least `grace`, so safe to drop from the key
    /// table.
    pub(crate) fn idle_for(&self, grace: Duration) -> bool {
        let state = self.lock();
        !state.bound && state.jobs.is_empty() && state.last_active.elapsed() >= grace
    }

    fn lock(&self) -> MutexGuard<'_, UnionState<P, O>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
