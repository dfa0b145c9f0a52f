//! In-process registry with etcd-like lease semantics.
//!
//! Leases expire on a real clock: a lease not renewed within its TTL is
//! dropped together with every key bound to it, and watchers see the
//! deletions. Fault hooks let tests break keepalives, stall calls, or take
//! the whole store offline.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{KeepAliveStream, LeaseId, RegistryStore, WatchEvent, WatchStream};
use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_lease: AtomicI64,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    faults: Faults,
}

struct Entry {
    value: Vec<u8>,
    lease: LeaseId,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
    alive: CancellationToken,
}

#[derive(Default)]
struct Faults {
    broken_keepalives: u32,
    unavailable: bool,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task that expires overdue leases every `interval` until
    /// `cancel` fires.
    pub fn spawn_reaper(&self, interval: Duration, cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = store.state().expire_due(Instant::now());
                        if expired > 0 {
                            debug!(expired, "memory registry expired leases");
                        }
                    }
                }
            }
        });
    }

    /// The next `count` keepalive calls return an already-closed stream.
    pub fn break_next_keepalives(&self, count: u32) {
        self.state().faults.broken_keepalives = count;
    }

    /// While set, every call fails with [`Error::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().faults.unavailable = unavailable;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().faults.latency = latency;
    }

    /// Ends every open watch stream, as a registry failover would.
    pub fn drop_watches(&self) {
        self.state().watchers.clear();
    }

    /// Drops `lease` as if its TTL had elapsed.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.state();
        let existed = state.leases.contains_key(&lease);
        state.drop_lease(lease);
        if existed {
            info!(%lease, "memory registry lease expired by request");
        }
        existed
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state();
        state.expire_due(Instant::now());
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.state().entries.get(key).map(|entry| entry.lease)
    }

    pub fn lease_count(&self) -> usize {
        self.state().leases.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies injected latency and availability, and expires overdue leases.
    async fn enter(&self) -> Result<()> {
        let latency = self.state().faults.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        if state.faults.unavailable {
            return Err(Error::Unavailable("registry unreachable".into()));
        }
        state.expire_due(Instant::now());
        Ok(())
    }
}

impl State {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|(prefix, tx)| {
            if !event.key().starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(lease) = self.leases.get_mut(&entry.lease) {
            lease.keys.remove(key);
        }
        self.notify(WatchEvent::Delete {
            key: key.to_string(),
        });
        true
    }

    fn drop_lease(&mut self, id: LeaseId) {
        let Some(lease) = self.leases.remove(&id) else {
            return;
        };
        lease.alive.cancel();
        for key in lease.keys {
            if self.entries.get(&key).is_some_and(|entry| entry.lease == id) {
                self.entries.remove(&key);
                self.notify(WatchEvent::Delete { key });
            }
        }
    }

    fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.drop_lease(*id);
        }
        due.len()
    }

    /// Extends `id` by its TTL, returning the TTL, or `None` if the lease
    /// is gone.
    fn renew(&mut self, id: LeaseId, now: Instant) -> Option<Duration> {
        let lease = self.leases.get_mut(&id)?;
        if lease.deadline <= now {
            self.drop_lease(id);
            return None;
        }
        lease.deadline = now + lease.ttl;
        Some(lease.ttl)
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.enter().await?;
        if ttl.is_zero() {
            return Err(Error::Config("lease ttl must be non-zero".into()));
        }
        let id = LeaseId(self.shared.next_lease.fetch_add(1, Ordering::Relaxed) + 1);
        self.state().leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
                alive: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.enter().await?;
        let mut state = self.state();
        let Some(owner) = state.leases.get_mut(&lease) else {
            return Err(Error::Store(format!("lease {lease} not found")));
        };
        owner.keys.insert(key.to_string());

        let previous = state.entries.insert(
            key.to_string(),
            Entry {
                value: value.as_bytes().to_vec(),
                lease,
            },
        );
        if let Some(previous) = previous.filter(|p| p.lease != lease) {
            if let Some(old) = state.leases.get_mut(&previous.lease) {
                old.keys.remove(key);
            }
        }
        state.notify(WatchEvent::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        });
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.enter().await?;
        let (tx, rx) = mpsc::channel(4);
        let alive = {
            let mut state = self.state();
            if state.faults.broken_keepalives > 0 {
                state.faults.broken_keepalives -= 1;
                debug!(%lease, "memory registry handing out a broken keepalive");
                return Ok(rx);
            }
            match state.leases.get(&lease) {
                Some(l) => l.alive.clone(),
                None => return Err(Error::Store(format!("lease {lease} not found"))),
            }
        };

        let store = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(ttl) = store.state().renew(lease, Instant::now()) else {
                    break;
                };
                if tx.send(lease).await.is_err() {
                    break;
                }
                let period = (ttl / 3).max(Duration::from_millis(1));
                tokio::select! {
                    _ = alive.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.enter().await?;
        self.state().drop_lease(lease);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter().await?;
        self.state().remove_entry(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.enter().await?;
        Ok(self
            .state()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.enter().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }
}
