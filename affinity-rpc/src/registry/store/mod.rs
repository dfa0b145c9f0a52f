//! The registry backend seam.
//!
//! A [`RegistryStore`] is a key-value store with TTL leases and prefix
//! watches, the subset of etcd v3 the registrar and discovery need.

mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use memory::MemoryStore;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Keepalive acknowledgements; the channel closes when the lease is lost.
pub type KeepAliveStream = mpsc::Receiver<LeaseId>;

/// Changes under a prefix; the channel closes when the watch breaks.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Writes `key`, bound to `lease` so it vanishes when the lease does.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Starts renewing `lease`. The first acknowledgement arrives promptly.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revokes `lease` and deletes its keys. Unknown leases are not an error.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries under `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribes to changes under `prefix` made after this call returns.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}
