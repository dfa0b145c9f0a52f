use std::sync::{Arc, Mutex};
use std::time::Duration;

use affinity_rpc::{
    Error,
    balancer::{Address, AddressSink},
    config::RegistryConfig,
    registry::{Discovery, MemoryStore, Registrar, ResolverBuilder, ServiceInstance, Watcher},
};
use anyhow::Result;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        ttl_ms: 1_000,
        max_retry: 3,
        retry_backoff_ms: 10,
        register_timeout_ms: 200,
        watch_retry_delay_ms: 20,
        ..RegistryConfig::default()
    }
}

fn node(id: &str, grpc_port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "game")
        .with_endpoint(format!("http://127.0.0.1:{}", grpc_port - 1000))
        .with_endpoint(format!("grpc://127.0.0.1:{grpc_port}"))
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) -> Result<()> {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for {what}"))
}

#[tokio::test]
async fn registration_is_visible_to_discovery() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), cancel.clone())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), cancel.clone())?;

    let mut watcher = discovery.watch("game").await?;
    registrar.register(&node("1", 9001)).await?;

    let seen = timeout(WAIT, watcher.next()).await??;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "1");
    assert_eq!(seen[0].endpoint("grpc"), Some("grpc://127.0.0.1:9001"));

    registrar.unregister(&node("1", 9001)).await?;
    let seen = timeout(WAIT, watcher.next()).await??;
    assert!(seen.is_empty());
    assert!(discovery.get_service("game").is_empty());

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn stopped_heartbeat_lets_the_lease_expire() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let reaper = CancellationToken::new();
    store.spawn_reaper(Duration::from_millis(50), reaper.clone());

    let node_token = CancellationToken::new();
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), node_token.clone())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let _watcher = discovery.watch("game").await?;

    registrar.register(&node("1", 9001)).await?;
    wait_until("instance discovered", || discovery.get_service("game").len() == 1).await?;

    // The process "dies": the heartbeat stops without revoking anything.
    node_token.cancel();
    wait_until("lease expiry", || discovery.get_service("game").is_empty()).await?;
    assert_eq!(store.lease_count(), 0);

    reaper.cancel();
    Ok(())
}

#[tokio::test]
async fn heartbeat_recovers_while_retries_remain() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let instance = node("1", 9001);
    let first = registrar.register(&instance).await?;

    // Lose the lease, then fail the first re-registration attempts: with
    // max_retry = 3, two more broken keepalives still leave one attempt.
    store.break_next_keepalives(2);
    assert!(store.expire_lease(first));

    wait_until("re-registration", || {
        registrar.lease_of(&instance).is_some_and(|lease| lease != first)
            && store.get("/servers/node/game/1").is_some()
    })
    .await?;
    assert!(registrar.is_heartbeat_alive(&instance));
    assert_eq!(store.lease_count(), 1);
    Ok(())
}

#[tokio::test]
async fn heartbeat_gives_up_after_max_retry() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let instance = node("1", 9001);
    let first = registrar.register(&instance).await?;

    store.break_next_keepalives(3);
    assert!(store.expire_lease(first));

    wait_until("heartbeat exit", || !registrar.is_heartbeat_alive(&instance)).await?;
    assert!(store.get("/servers/node/game/1").is_none());
    assert_eq!(store.lease_count(), 0);
    Ok(())
}

#[tokio::test]
async fn discovery_reseeds_after_watch_loss() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;

    registrar.register(&node("1", 9001)).await?;
    let mut watcher = discovery.watch("game").await?;
    assert_eq!(timeout(WAIT, watcher.next()).await??.len(), 1);

    // Changes made while no watch is open are picked up by the reseed.
    store.drop_watches();
    registrar.register(&node("2", 9002)).await?;

    wait_until("reseed", || discovery.get_service("game").len() == 2).await?;
    let ids: Vec<String> = discovery
        .get_service("game")
        .into_iter()
        .map(|instance| instance.id)
        .collect();
    assert_eq!(ids, ["1", "2"]);
    Ok(())
}

#[tokio::test]
async fn unregister_after_lease_expiry_succeeds() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let instance = node("1", 9001);
    let lease = registrar.register(&instance).await?;

    store.break_next_keepalives(3);
    assert!(store.expire_lease(lease));
    wait_until("heartbeat exit", || !registrar.is_heartbeat_alive(&instance)).await?;

    registrar.unregister(&instance).await?;
    assert!(registrar.lease_of(&instance).is_none());
    assert!(store.get("/servers/node/game/1").is_none());
    Ok(())
}

#[tokio::test]
async fn empty_name_lists_every_service() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;

    registrar.register(&node("1", 9001)).await?;
    registrar
        .register(&ServiceInstance::new("7", "chat").with_endpoint("grpc://127.0.0.1:7001"))
        .await?;
    let _all = discovery.watch("").await?;

    let everything = discovery.get_service("");
    let names: Vec<&str> = everything.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["chat", "game"]);
    assert_eq!(discovery.get_service("game").len(), 1);
    assert_eq!(discovery.get_service("chat").len(), 1);
    Ok(())
}

/// Calls `next` until the snapshot holds `count` instances.
async fn next_until(watcher: &mut Watcher<MemoryStore>, count: usize) -> Result<()> {
    let name = watcher.name().to_string();
    timeout(WAIT, async {
        loop {
            if watcher.next().await?.len() == count {
                return Ok::<_, Error>(());
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("watcher for '{name}' never saw {count} instances"))??;
    Ok(())
}

#[tokio::test]
async fn overlapping_watches_each_see_every_change() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;

    let mut all = discovery.watch("").await?;
    let mut game = discovery.watch("game").await?;

    registrar.register(&node("1", 9001)).await?;
    next_until(&mut game, 1).await?;
    next_until(&mut all, 1).await?;

    registrar.register(&node("2", 9002)).await?;
    next_until(&mut game, 2).await?;
    next_until(&mut all, 2).await?;

    registrar.unregister(&node("1", 9001)).await?;
    next_until(&mut game, 1).await?;
    next_until(&mut all, 1).await?;
    assert_eq!(discovery.get_service("game")[0].id, "2");
    Ok(())
}

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<Vec<Address>>>,
}

impl RecordingSink {
    fn updates(&self) -> Vec<Vec<Address>> {
        self.updates.lock().unwrap().clone()
    }
}

impl AddressSink for RecordingSink {
    fn update_state(&self, addresses: Vec<Address>) -> affinity_rpc::Result<()> {
        self.updates.lock().unwrap().push(addresses);
        Ok(())
    }
}

#[tokio::test]
async fn resolver_fails_fast_on_slow_watch_setup() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_latency(Duration::from_millis(500));
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;

    let started = tokio::time::Instant::now();
    let err = ResolverBuilder::new(discovery)
        .setup_timeout(Duration::from_millis(50))
        .build("discovery:///game", Arc::new(RecordingSink::default()))
        .await
        .err()
        .expect("slow watch setup must fail");
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(400));
    Ok(())
}

#[tokio::test]
async fn resolver_suppresses_empty_sets_and_dedups() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let discovery = Discovery::new(Arc::clone(&store), fast_config(), CancellationToken::new())?;
    let sink = Arc::new(RecordingSink::default());
    let mut resolver = ResolverBuilder::new(discovery)
        .build("discovery:///game", Arc::clone(&sink) as Arc<dyn AddressSink>)
        .await?;

    // An instance without a grpc endpoint produces no usable backends.
    let http_only = ServiceInstance::new("0", "game").with_endpoint("http://127.0.0.1:8000");
    registrar.register(&http_only).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.updates().is_empty());

    // Two instances advertising the same grpc endpoint collapse into one.
    registrar.register(&node("1", 9001)).await?;
    registrar.register(&node("2", 9001)).await?;
    wait_until("deduplicated update", || {
        sink.updates()
            .last()
            .is_some_and(|last| last.len() == 1 && last[0].addr == "127.0.0.1:9001")
    })
    .await?;

    // Losing every grpc backend keeps the last good set.
    let before = sink.updates().len();
    registrar.unregister(&node("1", 9001)).await?;
    registrar.unregister(&node("2", 9001)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let updates = sink.updates();
    assert!(updates.len() >= before);
    assert!(updates.iter().all(|update| !update.is_empty()));
    assert_eq!(updates.last().map(Vec::len), Some(1));

    resolver.close().await;
    Ok(())
}
