use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::PoolStats;
use super::job::{Job, JobHandler};
use super::pool::{Pool, WorkerId};
use super::union::JobUnion;
use crate::config::DispatchConfig;
use crate::error::{Error, Result};

type UnionOf<H> = JobUnion<<H as JobHandler>::Payload, <H as JobHandler>::Output>;
type JobOf<H> = Job<<H as JobHandler>::Payload, <H as JobHandler>::Output>;

/// Per-key FIFO executor with an elastic worker pool.
///
/// Jobs with the same key run one after another in scheduling order; jobs
/// with different keys run in parallel on separate workers. A single
/// coordinator task binds workers to keys that need one and periodically
/// shrinks the pool and the key table.
pub struct Dispatcher<H: JobHandler> {
    shared: Arc<Shared<H>>,
    needs_worker: mpsc::UnboundedSender<Arc<UnionOf<H>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<H: JobHandler> {
    config: DispatchConfig,
    handler: Arc<H>,
    table: Mutex<KeyTable<UnionOf<H>>>,
    pool: Mutex<Pool<Arc<UnionOf<H>>>>,
    cancel: CancellationToken,
}

struct KeyTable<U> {
    unions: BTreeMap<String, Arc<U>>,
    /// Last key examined by union collection; the next pass resumes after it.
    cursor: Option<String>,
}

impl<H: JobHandler> Dispatcher<H> {
    /// Pre-spawns `max_idle` workers and starts the coordinator. Stops when
    /// `cancel` fires or on [`Dispatcher::shutdown`].
    pub fn start(
        mut config: DispatchConfig,
        handler: Arc<H>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        if config.max_workers < config.max_idle {
            debug!(
                max_workers = config.max_workers,
                max_idle = config.max_idle,
                "raising worker ceiling to the idle watermark"
            );
            config.max_workers = config.max_idle;
        }

        let shared = Arc::new(Shared {
            config,
            handler,
            table: Mutex::new(KeyTable {
                unions: BTreeMap::new(),
                cursor: None,
            }),
            pool: Mutex::new(Pool::new()),
            cancel: cancel.child_token(),
        });
        shared.grow(shared.config.max_idle);

        let (needs_worker, signals) = mpsc::unbounded_channel();
        let coordinator = tokio::spawn(coordinate(Arc::clone(&shared), signals));
        info!(
            max_idle = shared.config.max_idle,
            max_workers = shared.config.max_workers,
            "dispatcher started"
        );
        Ok(Self {
            shared,
            needs_worker,
            coordinator: Mutex::new(Some(coordinator)),
        })
    }

    /// Queues `job` behind earlier jobs with the same key.
    pub fn schedule(&self, job: JobOf<H>) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let union = {
            let mut table = self.shared.table();
            let union = Arc::clone(
                table
                    .unions
                    .entry(job.key().to_string())
                    .or_insert_with_key(|key| Arc::new(JobUnion::new(key.clone()))),
            );
            if !union.push(job) {
                return Ok(());
            }
            union
        };
        self.needs_worker.send(union).map_err(|_| Error::Canceled)
    }

    /// Schedules `payload` under `key` and waits for its result.
    pub async fn execute(&self, key: impl Into<String>, payload: H::Payload) -> Result<H::Output> {
        let (reply, mut result) = mpsc::channel(1);
        self.schedule(Job::new(key, payload).with_reply(reply))?;
        result.recv().await.unwrap_or(Err(Error::Canceled))
    }

    pub fn stats(&self) -> PoolStats {
        let (workers, idle) = {
            let pool = self.shared.pool();
            (pool.len(), pool.idle_len())
        };
        PoolStats {
            workers,
            idle,
            busy: workers.saturating_sub(idle),
            keys: self.shared.table().unions.len(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Stops the coordinator and every worker. Jobs still queued are
    /// answered with [`Error::Canceled`].
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let coordinator = self
            .coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(coordinator) = coordinator {
            if let Err(err) = coordinator.await {
                warn!(error = ?err, "dispatcher coordinator failed");
            }
        }
    }
}

impl<H: JobHandler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<H: JobHandler> Shared<H> {
    fn table(&self) -> MutexGuard<'_, KeyTable<UnionOf<H>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pool(&self) -> MutexGuard<'_, Pool<Arc<UnionOf<H>>>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns `count` idle workers and returns the new pool size.
    fn grow(self: &Arc<Self>, count: usize) -> usize {
        let mut pool = self.pool();
        for _ in 0..count {
            let (inbox_tx, inbox) = mpsc::channel(1);
            let id = pool.insert(inbox_tx);
            tokio::spawn(run_worker(Arc::clone(self), id, inbox));
        }
        pool.len()
    }

    fn assign(self: &Arc<Self>, mut union: Arc<UnionOf<H>>) {
        loop {
            if self.cancel.is_cancelled() {
                self.abandon(&union);
                return;
            }
            let idle = self.pool().take_idle();
            let Some((id, inbox)) = idle else {
                let workers = self.grow(self.config.max_idle);
                if workers > self.config.max_workers {
                    warn!(
                        workers,
                        max_workers = self.config.max_workers,
                        "worker pool above its soft ceiling"
                    );
                }
                continue;
            };
            trace!(worker = id, key = union.key(), "binding worker");
            match inbox.try_send(union) {
                Ok(()) => return,
                Err(TrySendError::Full(back) | TrySendError::Closed(back)) => {
                    self.pool().forget(id);
                    union = back;
                }
            }
        }
    }

    /// Runs the union's jobs until it is empty, then releases it under the
    /// table lock so a concurrent schedule either lands before the release
    /// or requests a fresh worker.
    async fn drain(&self, union: &UnionOf<H>) {
        loop {
            if self.cancel.is_cancelled() {
                self.abandon(union);
                return;
            }
            if let Some(job) = union.pop() {
                self.run(job).await;
                continue;
            }
            let _table = self.table();
            if union.release() {
                return;
            }
        }
    }

    async fn run(&self, job: JobOf<H>) {
        let Job {
            meta,
            payload,
            reply,
        } = job;
        let outcome = AssertUnwindSafe(self.handler.handle(&meta, payload))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(key = %meta.key, panic = %message, "job panicked, worker recovered");
                Err(Error::RecoveredPanic {
                    key: meta.key.clone(),
                    message,
                })
            }
        };

        let Some(reply) = reply else { return };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = reply.send(result) => {
                if sent.is_err() {
                    debug!(key = %meta.key, "result receiver dropped");
                }
            }
        }
    }

    fn abandon(&self, union: &UnionOf<H>) {
        for job in union.abandon() {
            if let Some(reply) = job.reply {
                let _ = reply.try_send(Err(Error::Canceled));
            }
        }
    }

    fn shrink(&self) {
        let retired = self
            .pool()
            .retire_idle(self.config.max_idle, self.config.worker_recycle_batch);
        let collected = self.collect_unions();
        if retired > 0 || collected > 0 {
            debug!(retired, collected, "dispatcher shrunk");
        }
    }

    /// Drops unions that stayed empty and unbound for a whole shrink
    /// interval, examining at most `union_recycle_batch` entries starting
    /// after the cursor and wrapping around.
    fn collect_unions(&self) -> usize {
        let grace = self.config.shrink_interval();
        let mut table = self.table();
        let cursor = table.cursor.take();
        let (tail, head) = match cursor.as_deref() {
            Some(last) => (
                (Bound::Excluded(last), Bound::Unbounded),
                (Bound::Unbounded, Bound::Included(last)),
            ),
            None => (
                (Bound::Unbounded, Bound::Unbounded),
                (Bound::Unbounded, Bound::Excluded("")),
            ),
        };
        let examined: Vec<(String, bool)> = table
            .unions
            .range::<str, _>(tail)
            .chain(table.unions.range::<str, _>(head))
            .take(self.config.union_recycle_batch)
            .map(|(key, union)| (key.clone(), union.idle_for(grace)))
            .collect();

        table.cursor = examined.last().map(|(key, _)| key.clone());
        let mut collected = 0;
        for (key, idle) in examined {
            if idle {
                table.unions.remove(&key);
                collected += 1;
            }
        }
        collected
    }
}

async fn coordinate<H: JobHandler>(
    shared: Arc<Shared<H>>,
    mut signals: mpsc::UnboundedReceiver<Arc<UnionOf<H>>>,
) {
    let period = shared.config.shrink_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            Some(union) = signals.recv() => shared.assign(union),
            _ = ticker.tick() => shared.shrink(),
        }
    }

    signals.close();
    while let Ok(union) = signals.try_recv() {
        shared.abandon(&union);
    }
    shared.pool().clear();
    info!("dispatcher stopped");
}

async fn run_worker<H: JobHandler>(
    shared: Arc<Shared<H>>,
    id: WorkerId,
    mut inbox: mpsc::Receiver<Arc<UnionOf<H>>>,
) {
    loop {
        let union = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            union = inbox.recv() => match union {
                Some(union) => union,
                None => break,
            },
        };
        shared.drain(&union).await;
        if shared.cancel.is_cancelled() {
            break;
        }
        shared.pool().park(id);
    }
    trace!(worker = id, "worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::JobMeta;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        type Payload = u32;
        type Output = String;

        async fn handle(&self, meta: &JobMeta, payload: u32) -> Result<String> {
            if payload == 13 {
                panic!("unlucky job for {}", meta.key);
            }
            Ok(format!("{}:{payload}", meta.key))
        }
    }

    fn small(max_workers: usize, max_idle: usize) -> DispatchConfig {
        DispatchConfig {
            max_workers,
            max_idle,
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn ten_jobs_on_five_keys() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(small(5, 5), Arc::new(Echo), &cancel).unwrap();

        let mut receivers = Vec::new();
        for i in 0..10u32 {
            let key = format!("key-{}", i % 5);
            let (tx, rx) = mpsc::channel(1);
            dispatcher
                .schedule(Job::new(key.clone(), i).with_reply(tx))
                .unwrap();
            receivers.push((format!("{key}:{i}"), rx));
        }
        for (expected, mut rx) in receivers {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("job finished")
                .expect("result delivered")
                .unwrap();
            assert_eq!(got, expected);
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn panic_is_reported_and_worker_survives() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(small(1, 1), Arc::new(Echo), &cancel).unwrap();

        let err = dispatcher.execute("k", 13).await.unwrap_err();
        assert!(matches!(err, Error::RecoveredPanic { ref key, .. } if key == "k"));
        assert_eq!(dispatcher.execute("k", 1).await.unwrap(), "k:1");
        assert_eq!(dispatcher.stats().workers, 1);
    }

    #[tokio::test]
    async fn max_workers_raised_to_idle_watermark() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(small(1, 4), Arc::new(Echo), &cancel).unwrap();
        assert_eq!(dispatcher.config().max_workers, 4);
        assert_eq!(dispatcher.stats().workers, 4);
        assert_eq!(dispatcher.stats().idle, 4);
    }

    #[tokio::test]
    async fn schedule_after_shutdown_is_canceled() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(small(2, 2), Arc::new(Echo), &cancel).unwrap();
        cancel.cancel();
        dispatcher.shutdown().await;
        assert!(matches!(
            dispatcher.schedule(Job::new("k", 1)),
            Err(Error::Canceled)
        ));
        assert_eq!(dispatcher.stats().workers, 0);
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl JobHandler for Counting {
        type Payload = ();
        type Output = ();

        async fn handle(&self, _meta: &JobMeta, _payload: ()) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn idle_keys_are_collected_across_ticks() {
        let cancel = CancellationToken::new();
        let config = DispatchConfig {
            max_workers: 2,
            max_idle: 2,
            shrink_interval_ms: 20,
            union_recycle_batch: 3,
            ..DispatchConfig::default()
        };
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::start(config, Arc::clone(&handler), &cancel).unwrap();
        for i in 0..10 {
            dispatcher.execute(format!("key-{i}"), ()).await.unwrap();
        }
        assert_eq!(handler.0.load(Ordering::SeqCst), 10);

        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.stats().keys > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("every idle key collected");
    }
}
