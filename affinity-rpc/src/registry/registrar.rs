//! Keeps service instances registered under renewed leases.
//!
//! Each registered instance owns exactly one lease and one heartbeat task.
//! The heartbeat consumes keepalive acknowledgements; when the stream closes
//! the lease is considered lost and the instance is written again under a
//! fresh lease, with a bounded number of attempts per loss.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::store::{KeepAliveStream, LeaseId, RegistryStore};
use super::{ServiceInstance, instance_key};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

pub struct Registrar<S: RegistryStore> {
    store: Arc<S>,
    config: RegistryConfig,
    cancel: CancellationToken,
    registrations: Mutex<HashMap<String, Registration>>,
}

struct Registration {
    lease: Arc<Mutex<LeaseId>>,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
}

impl<S: RegistryStore> Registrar<S> {
    pub fn new(store: Arc<S>, config: RegistryConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            cancel,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Writes `instance` under a new lease and starts its heartbeat.
    ///
    /// Registering an instance that is already registered replaces the old
    /// lease and heartbeat.
    pub async fn register(&self, instance: &ServiceInstance) -> Result<LeaseId> {
        if instance.name.is_empty() || instance.id.is_empty() {
            return Err(Error::Config("instance name and id are required".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let key = instance_key(&self.config.namespace, instance);
        let value = instance.encode()?;

        if let Some(previous) = self.take(&key) {
            debug!(key = %key, "replacing existing registration");
            self.retire(previous).await;
        }

        let session = Session {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            key: key.clone(),
            value,
        };
        let lease = session.write().await?;
        let acks = match bounded(
            self.config.register_timeout(),
            "keepalive setup",
            self.store.keep_alive(lease),
        )
        .await
        {
            Ok(acks) => acks,
            Err(err) => {
                session.discard(lease).await;
                return Err(err);
            }
        };

        let cancel = self.cancel.child_token();
        let current = Arc::new(Mutex::new(lease));
        let heartbeat = tokio::spawn(heartbeat(
            session,
            acks,
            Arc::clone(&current),
            cancel.clone(),
        ));
        let replaced = self.registrations_lock().insert(
            key.clone(),
            Registration {
                lease: current,
                cancel,
                heartbeat,
            },
        );
        if let Some(replaced) = replaced {
            replaced.cancel.cancel();
        }

        info!(key = %key, %lease, "instance registered");
        Ok(lease)
    }

    /// Stops the heartbeat, revokes the lease and deletes the record.
    pub async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = instance_key(&self.config.namespace, instance);
        let timeout = self.config.register_timeout();
        if let Some(registration) = self.take(&key) {
            let lease = *lock(&registration.lease);
            registration.cancel.cancel();
            let _ = registration.heartbeat.await;
            bounded(timeout, "lease revoke", self.store.revoke(lease)).await?;
        }
        bounded(timeout, "registry delete", self.store.delete(&key)).await?;
        info!(key = %key, "instance unregistered");
        Ok(())
    }

    /// Unregisters every instance this registrar still tracks.
    pub async fn unregister_all(&self) {
        let drained: Vec<(String, Registration)> = self.registrations_lock().drain().collect();
        for (key, registration) in drained {
            let lease = *lock(&registration.lease);
            registration.cancel.cancel();
            let _ = registration.heartbeat.await;
            let timeout = self.config.register_timeout();
            if let Err(err) = bounded(timeout, "lease revoke", self.store.revoke(lease)).await {
                warn!(key = %key, error = ?err, "failed to revoke lease");
            }
            if let Err(err) = bounded(timeout, "registry delete", self.store.delete(&key)).await {
                warn!(key = %key, error = ?err, "failed to delete registration");
            }
        }
    }

    pub fn is_heartbeat_alive(&self, instance: &ServiceInstance) -> bool {
        let key = instance_key(&self.config.namespace, instance);
        self.registrations_lock()
            .get(&key)
            .is_some_and(|registration| !registration.heartbeat.is_finished())
    }

    /// The lease currently backing `instance`, if it is registered here.
    pub fn lease_of(&self, instance: &ServiceInstance) -> Option<LeaseId> {
        let key = instance_key(&self.config.namespace, instance);
        self.registrations_lock()
            .get(&key)
            .map(|registration| *lock(&registration.lease))
    }

    fn take(&self, key: &str) -> Option<Registration> {
        self.registrations_lock().remove(key)
    }

    async fn retire(&self, registration: Registration) {
        let lease = *lock(&registration.lease);
        registration.cancel.cancel();
        let _ = registration.heartbeat.await;
        let timeout = self.config.register_timeout();
        if let Err(err) = bounded(timeout, "lease revoke", self.store.revoke(lease)).await {
            warn!(%lease, error = ?err, "failed to revoke replaced lease");
        }
    }

    fn registrations_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Registration>> {
        lock(&self.registrations)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything a heartbeat needs to write its record again.
struct Session<S: RegistryStore> {
    store: Arc<S>,
    config: RegistryConfig,
    key: String,
    value: String,
}

impl<S: RegistryStore> Session<S> {
    /// Grants a lease and binds the record to it.
    async fn write(&self) -> Result<LeaseId> {
        let timeout = self.config.register_timeout();
        let lease = bounded(timeout, "lease grant", self.store.grant(self.config.ttl())).await?;
        if let Err(err) = bounded(
            timeout,
            "registry put",
            self.store.put(&self.key, &self.value, lease),
        )
        .await
        {
            self.discard(lease).await;
            return Err(err);
        }
        Ok(lease)
    }

    /// One re-registration attempt: a fresh lease, the record, and a
    /// keepalive stream that has delivered its first acknowledgement.
    async fn attempt(&self) -> Result<(LeaseId, KeepAliveStream)> {
        let timeout = self.config.register_timeout();
        let lease = self.write().await?;
        let keepalive = async {
            let mut acks = self.store.keep_alive(lease).await?;
            match acks.recv().await {
                Some(_) => Ok(acks),
                None => Err(Error::Transient(
                    "keepalive closed before first acknowledgement".into(),
                )),
            }
        };
        match bounded(timeout, "keepalive", keepalive).await {
            Ok(acks) => Ok((lease, acks)),
            Err(err) => {
                self.discard(lease).await;
                Err(err)
            }
        }
    }

    async fn discard(&self, lease: LeaseId) {
        let timeout = self.config.register_timeout();
        if let Err(err) = bounded(timeout, "lease revoke", self.store.revoke(lease)).await {
            debug!(key = %self.key, %lease, error = ?err, "failed to revoke abandoned lease");
        }
    }
}

async fn heartbeat<S: RegistryStore>(
    session: Session<S>,
    mut acks: KeepAliveStream,
    current: Arc<Mutex<LeaseId>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            ack = acks.recv() => match ack {
                Some(lease) => trace!(key = %session.key, %lease, "keepalive acknowledged"),
                None => {
                    warn!(key = %session.key, "keepalive stream closed, lease lost");
                    match reregister(&session, &cancel).await {
                        Some((lease, renewed)) => {
                            *lock(&current) = lease;
                            acks = renewed;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Runs one re-registration round. `None` means the round was exhausted or
/// the heartbeat was canceled.
async fn reregister<S: RegistryStore>(
    session: &Session<S>,
    cancel: &CancellationToken,
) -> Option<(LeaseId, KeepAliveStream)> {
    let mut backoff = Backoff::new(session.config.retry_backoff(), session.config.ttl());
    for attempt in 0..session.config.max_retry {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = session.attempt() => outcome,
        };
        let err = match outcome {
            Ok((lease, acks)) => {
                info!(key = %session.key, %lease, attempt, "instance re-registered");
                return Some((lease, acks));
            }
            Err(err) => err,
        };

        let delay = backoff.next_delay();
        warn!(
            key = %session.key,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "re-registration failed"
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    error!(
        key = %session.key,
        max_retry = session.config.max_retry,
        "re-registration retries exhausted, heartbeat stopped"
    );
    None
}

/// Randomized doubling backoff.
///
/// Attempt `i` appends `base * 2^i` to the schedule while it stays within
/// `max(ttl / 2, base)`; each delay is drawn uniformly from the schedule
/// accumulated so far.
struct Backoff {
    base: Duration,
    ceiling: Duration,
    schedule: Vec<Duration>,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, ttl: Duration) -> Self {
        Self {
            base,
            ceiling: (ttl / 2).max(base),
            schedule: Vec::new(),
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let step = self.base.saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX));
        if step <= self.ceiling {
            self.schedule.push(step);
        }
        self.attempt += 1;
        let idx = rand::thread_rng().gen_range(0..self.schedule.len());
        self.schedule[idx]
    }
}

async fn bounded<T, F>(after: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout { what, after })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            ttl_ms: 1_000,
            retry_backoff_ms: 10,
            register_timeout_ms: 200,
            max_retry: 3,
            ..RegistryConfig::default()
        }
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(15));
        for _ in 0..6 {
            let delay = backoff.next_delay();
            assert!(backoff.schedule.contains(&delay));
        }
        // 1, 2, 4 fit under 7.5s; 8, 16 and 32 do not.
        assert_eq!(
            backoff.schedule,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn backoff_never_empty_with_short_ttl() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn register_then_unregister() {
        let store = Arc::new(MemoryStore::new());
        let registrar =
            Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new()).unwrap();
        let instance = ServiceInstance::new("1", "game").with_endpoint("grpc://127.0.0.1:9000");

        let lease = registrar.register(&instance).await.unwrap();
        assert_eq!(registrar.lease_of(&instance), Some(lease));
        assert!(registrar.is_heartbeat_alive(&instance));
        assert!(store.get("/servers/node/game/1").is_some());

        registrar.unregister(&instance).await.unwrap();
        assert!(store.get("/servers/node/game/1").is_none());
        assert_eq!(registrar.lease_of(&instance), None);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn re_register_replaces_lease() {
        let store = Arc::new(MemoryStore::new());
        let registrar =
            Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new()).unwrap();
        let instance = ServiceInstance::new("1", "game");

        let first = registrar.register(&instance).await.unwrap();
        let second = registrar.register(&instance).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.lease_count(), 1);
        assert_eq!(store.lease_of("/servers/node/game/1"), Some(second));
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let registrar = Registrar::new(
            Arc::new(MemoryStore::new()),
            fast_config(),
            CancellationToken::new(),
        )
        .unwrap();
        let err = registrar
            .register(&ServiceInstance::new("", "game"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_millis(500));
        let registrar =
            Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new()).unwrap();
        let err = registrar
            .register(&ServiceInstance::new("1", "game"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { what: "lease grant", .. }));
    }
}
