//! Watch-driven mirror of registry membership.
//!
//! The first watch of a service name seeds an in-memory table from a prefix
//! read and spawns one task that applies PUT/DELETE events for that name.
//! Readers never touch the registry: [`Discovery::get_service`] is a snapshot
//! of the table, and [`Watcher::next`] wakes when the name's revision moves.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{RegistryStore, WatchEvent, WatchStream};
use super::{ServiceInstance, service_prefix};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

pub struct Discovery<S: RegistryStore> {
    inner: Arc<Inner<S>>,
}

impl<S: RegistryStore> Clone for Discovery<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    store: Arc<S>,
    config: RegistryConfig,
    cancel: CancellationToken,
    instances: RwLock<BTreeMap<String, ServiceInstance>>,
    watches: Mutex<HashMap<String, NameWatch>>,
}

struct NameWatch {
    revision: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl<S: RegistryStore> Discovery<S> {
    pub fn new(store: Arc<S>, config: RegistryConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                cancel,
                instances: RwLock::new(BTreeMap::new()),
                watches: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Known instances of `name` (every instance when `name` is empty),
    /// ordered by registry key.
    pub fn get_service(&self, name: &str) -> Vec<ServiceInstance> {
        self.inner.snapshot(name)
    }

    /// Returns a watcher for `name`, starting the name's watch task on first
    /// use.
    pub async fn watch(&self, name: &str) -> Result<Watcher<S>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let mut watches = self.inner.watches.lock().await;
        if let Some(existing) = watches.get(name).filter(|w| !w.cancel.is_cancelled()) {
            return Ok(Watcher::new(self.clone(), name, existing));
        }

        let prefix = service_prefix(&self.inner.config.namespace, name);
        let stream = self.inner.subscribe(&prefix).await?;
        let (revision_tx, revision_rx) = watch::channel(0u64);
        let cancel = self.inner.cancel.child_token();
        let entry = NameWatch {
            revision: revision_rx,
            cancel: cancel.clone(),
        };
        let watcher = Watcher::new(self.clone(), name, &entry);
        watches.insert(name.to_string(), entry);
        drop(watches);

        tokio::spawn(run_watch(
            Arc::clone(&self.inner),
            name.to_string(),
            prefix,
            stream,
            revision_tx,
            cancel,
        ));
        info!(service = name, "discovery watch started");
        Ok(watcher)
    }

    /// Stops the watch task for `name`. Its watchers report `Canceled`.
    pub async fn unwatch(&self, name: &str) {
        if let Some(entry) = self.inner.watches.lock().await.remove(name) {
            entry.cancel.cancel();
            debug!(service = name, "discovery watch stopped");
        }
    }
}

impl<S: RegistryStore> Inner<S> {
    fn snapshot(&self, name: &str) -> Vec<ServiceInstance> {
        let prefix = service_prefix(&self.config.namespace, name);
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, instance)| instance.clone())
            .filter(|instance| name.is_empty() || instance.name == name)
            .collect()
    }

    /// Subscribes to `prefix` and then reseeds the table from a prefix read,
    /// so no change between the two is missed.
    async fn subscribe(&self, prefix: &str) -> Result<WatchStream> {
        let stream = self.store.watch_prefix(prefix).await?;
        let entries = self.store.get_prefix(prefix).await?;

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = instances
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            instances.remove(&key);
        }
        for (key, raw) in entries {
            match ServiceInstance::decode(&raw) {
                Ok(instance) => {
                    instances.insert(key, instance);
                }
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable registry record"),
            }
        }
        Ok(stream)
    }

    /// Applies one event to the shared table.
    ///
    /// Overlapping watches (an empty name covers every service) deliver the
    /// same event to several tasks, so the table may already hold it. The
    /// caller bumps its revision regardless.
    fn apply(&self, event: WatchEvent) {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        match event {
            WatchEvent::Put { key, value } => match ServiceInstance::decode(&value) {
                Ok(instance) => {
                    debug!(key = %key, "registry record updated");
                    instances.insert(key, instance);
                }
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable registry record"),
            },
            WatchEvent::Delete { key } => {
                if instances.remove(&key).is_some() {
                    debug!(key = %key, "registry record removed");
                }
            }
        }
    }
}

async fn run_watch<S: RegistryStore>(
    inner: Arc<Inner<S>>,
    name: String,
    prefix: String,
    mut stream: WatchStream,
    revision: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    let bump = |revision: &watch::Sender<u64>| revision.send_modify(|r| *r += 1);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = stream.recv() => match event {
                Some(event) => {
                    inner.apply(event);
                    bump(&revision);
                }
                None => {
                    warn!(service = %name, "registry watch ended, resubscribing");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(inner.config.watch_retry_delay()) => {}
                        }
                        match inner.subscribe(&prefix).await {
                            Ok(renewed) => {
                                stream = renewed;
                                bump(&revision);
                                break;
                            }
                            Err(err) => warn!(service = %name, error = %err, "resubscribe failed"),
                        }
                    }
                }
            }
        }
    }
    debug!(service = %name, "discovery watch task exiting");
}

/// A cursor over membership changes of one service name.
pub struct Watcher<S: RegistryStore> {
    discovery: Discovery<S>,
    name: String,
    revision: watch::Receiver<u64>,
    cancel: CancellationToken,
    first: bool,
}

impl<S: RegistryStore> Watcher<S> {
    fn new(discovery: Discovery<S>, name: &str, entry: &NameWatch) -> Self {
        let mut revision = entry.revision.clone();
        revision.borrow_and_update();
        Self {
            discovery,
            name: name.to_string(),
            revision,
            cancel: entry.cancel.child_token(),
            first: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next membership change and returns the new snapshot.
    ///
    /// The first call returns at once if instances are already known.
    pub async fn next(&mut self) -> Result<Vec<ServiceInstance>> {
        if std::mem::take(&mut self.first) {
            let snapshot = self.discovery.get_service(&self.name);
            if !snapshot.is_empty() {
                self.revision.borrow_and_update();
                return Ok(snapshot);
            }
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            changed = self.revision.changed() => match changed {
                Ok(()) => Ok(self.discovery.get_service(&self.name)),
                Err(_) if self.cancel.is_cancelled() => Err(Error::Canceled),
                Err(_) => Err(Error::Transient(format!("watch for '{}' is gone", self.name))),
            },
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
