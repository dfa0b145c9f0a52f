//! Keyed job execution on the serving node.
//!
//! Every key owns a FIFO queue (a job union). A worker bound to a union
//! drains it in order and releases it when empty, so one key never runs two
//! jobs at once while distinct keys proceed in parallel.

mod dispatcher;
mod job;
mod pool;
mod union;

use serde::Serialize;

pub use dispatcher::Dispatcher;
pub use job::{Job, JobHandler, JobMeta, JobResult};

/// Point-in-time view of a dispatcher's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Entries in the key table, including idle keys not yet collected.
    pub keys: usize,
}
