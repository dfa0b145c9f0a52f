use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use affinity_rpc::{
    balancer::{AddressSink, PickContext, Selector},
    cli::SimulateArgs,
    commands,
    config::{NodeConfig, RegistryConfig},
    registry::{Discovery, MemoryStore, Registrar, ResolverBuilder, ServiceInstance},
};
use anyhow::Result;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn instance(i: usize) -> ServiceInstance {
    ServiceInstance::new(format!("node-{i}"), "game")
        .with_endpoint(format!("grpc://10.0.0.{i}:9000"))
}

async fn wait_for_backends(selector: &Selector, count: usize) -> Result<()> {
    timeout(WAIT, async {
        while selector.ready().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn keys_follow_membership_with_minimal_movement() -> Result<()> {
    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(Arc::clone(&store), RegistryConfig::default(), cancel.clone())?;
    for i in 1..=4 {
        registrar.register(&instance(i)).await?;
    }

    let discovery = Discovery::new(Arc::clone(&store), RegistryConfig::default(), cancel.clone())?;
    let selector = Arc::new(Selector::new(160));
    let mut resolver = ResolverBuilder::new(discovery)
        .build("discovery:///game", Arc::clone(&selector) as Arc<dyn AddressSink>)
        .await?;
    wait_for_backends(&selector, 4).await?;

    let keys: Vec<String> = (0..2_000).map(|i| format!("player-{i}")).collect();
    let before: HashMap<&str, String> = keys
        .iter()
        .map(|key| Ok((key.as_str(), selector.pick(&PickContext::keyed(key))?.addr)))
        .collect::<affinity_rpc::Result<_>>()?;

    // Same key, same backend.
    for key in keys.iter().take(50) {
        assert_eq!(selector.pick(&PickContext::keyed(key))?.addr, before[key.as_str()]);
    }

    registrar.unregister(&instance(4)).await?;
    wait_for_backends(&selector, 3).await?;

    let mut moved = 0;
    for key in &keys {
        let after = selector.pick(&PickContext::keyed(key))?.addr;
        let previous = &before[key.as_str()];
        if previous != "10.0.0.4:9000" {
            assert_eq!(&after, previous, "{key} moved although its node stayed");
        } else {
            assert_ne!(after, "10.0.0.4:9000");
            moved += 1;
        }
    }
    assert!(moved > 0, "the removed node owned some keys");

    resolver.close().await;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn pick_without_key_is_a_routing_error() -> Result<()> {
    let selector = Selector::new(16);
    selector.update(vec![affinity_rpc::balancer::Address::new("10.0.0.1:9000")])?;
    let err = selector.pick(&PickContext::new()).unwrap_err();
    assert!(matches!(err, affinity_rpc::Error::Routing(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulated_fleet_keeps_keys_ordered_and_affine() -> Result<()> {
    let args = SimulateArgs {
        nodes: 3,
        keys: 12,
        jobs: 240,
        service: "sim".into(),
        max_workers: None,
        max_idle: None,
        ttl_ms: None,
        json: false,
    };
    let mut config = NodeConfig::default();
    config.dispatch.max_idle = 4;
    config.dispatch.max_workers = 8;
    config.ring.replicas = 64;

    let report = timeout(
        Duration::from_secs(20),
        commands::simulate(&args, &config, CancellationToken::new()),
    )
    .await??;
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(report.per_node.values().sum::<usize>(), 240);
    Ok(())
}
