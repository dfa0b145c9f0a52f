//! Operator commands behind the binary's subcommands.
//!
//! `simulate` wires the whole substrate together in one process: nodes
//! register through a [`Registrar`] and execute through a [`Dispatcher`],
//! while a client tracks them with [`Discovery`], feeds a [`Selector`]
//! through a resolver, and routes keyed jobs to whichever node owns each key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::{AddressSink, PickContext, Selector};
use crate::cli::{RouteArgs, SimulateArgs};
use crate::config::NodeConfig;
use crate::dispatch::{Dispatcher, Job, JobHandler, JobMeta};
use crate::registry::{
    Discovery, MemoryStore, Registrar, ResolverBuilder, ServiceInstance, endpoint,
};
use crate::ring::KeyRing;

/// Maps every key in `args` onto the ring of `args.nodes`.
pub fn route(args: &RouteArgs, config: &NodeConfig) -> Result<Vec<(String, String)>> {
    let ring = KeyRing::new(config.ring.replicas)?;
    ring.add(&args.nodes);
    args.keys
        .iter()
        .map(|key| {
            let node = ring
                .get(key)
                .with_context(|| format!("no node for key '{key}'"))?;
            Ok((key.clone(), node))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub keys: usize,
    pub jobs: usize,
    pub completed: usize,
    /// Jobs executed per node address.
    pub per_node: BTreeMap<String, usize>,
    /// Every key saw its jobs in scheduling order.
    pub ordered: bool,
    /// Every key ran on exactly one node.
    pub affine: bool,
}

impl SimulationReport {
    pub fn is_consistent(&self) -> bool {
        self.completed == self.jobs && self.ordered && self.affine
    }
}

/// One executed job as observed by a node.
#[derive(Debug, Clone)]
struct Execution {
    key: String,
    node: String,
    seq: usize,
}

struct SimNode {
    addr: String,
    log: Arc<Mutex<Vec<Execution>>>,
}

#[async_trait]
impl JobHandler for SimNode {
    type Payload = usize;
    type Output = usize;

    async fn handle(&self, meta: &JobMeta, seq: usize) -> crate::Result<usize> {
        let pause = rand::thread_rng().gen_range(0..500);
        tokio::time::sleep(Duration::from_micros(pause)).await;
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Execution {
                key: meta.key.clone(),
                node: self.addr.clone(),
                seq,
            });
        Ok(seq)
    }
}

/// Runs the in-process fleet until every job finished or `cancel` fires.
pub async fn simulate(
    args: &SimulateArgs,
    config: &NodeConfig,
    cancel: CancellationToken,
) -> Result<SimulationReport> {
    if args.nodes == 0 || args.keys == 0 {
        bail!("simulation needs at least one node and one key");
    }
    config.validate()?;

    let root = cancel.child_token();
    let store = Arc::new(MemoryStore::new());
    store.spawn_reaper(Duration::from_secs(1), root.child_token());
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registrars = Vec::with_capacity(args.nodes);
    let mut dispatchers = HashMap::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let addr = format!("127.0.0.1:{}", 9000 + i);
        let instance = ServiceInstance::new(format!("node-{i}"), &args.service)
            .with_endpoint(endpoint::new(&config.resolver.scheme, &addr))
            .with_metadata("index", i.to_string());

        let registrar = Registrar::new(Arc::clone(&store), config.registry.clone(), root.clone())?;
        registrar.register(&instance).await?;
        registrars.push(registrar);

        let handler = Arc::new(SimNode {
            addr: addr.clone(),
            log: Arc::clone(&log),
        });
        let dispatcher = Dispatcher::start(config.dispatch.clone(), handler, &root)?;
        dispatchers.insert(addr, dispatcher);
    }
    info!(nodes = args.nodes, service = %args.service, "simulated nodes registered");

    let discovery = Discovery::new(Arc::clone(&store), config.registry.clone(), root.clone())?;
    let selector = Arc::new(Selector::new(config.ring.replicas));
    let mut resolver = ResolverBuilder::from_config(discovery, &config.resolver)
        .build(
            &format!("discovery:///{}", args.service),
            Arc::clone(&selector) as Arc<dyn AddressSink>,
        )
        .await?;

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(anyhow::anyhow!("simulation interrupted")),
        outcome = drive(args, config, &selector, &dispatchers) => outcome,
    };

    resolver.close().await;
    for registrar in &registrars {
        registrar.unregister_all().await;
    }
    for dispatcher in dispatchers.values() {
        dispatcher.shutdown().await;
    }
    root.cancel();

    let completed = outcome?;
    let executions = log.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Ok(summarize(args, completed, &executions))
}

async fn drive(
    args: &SimulateArgs,
    config: &NodeConfig,
    selector: &Selector,
    dispatchers: &HashMap<String, Dispatcher<SimNode>>,
) -> Result<usize> {
    tokio::time::timeout(config.resolver.setup_timeout(), async {
        while selector.ready().len() < args.nodes {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("nodes never became routable")?;

    let (reply, mut results) = mpsc::channel(args.jobs.max(1));
    for seq in 0..args.jobs {
        let key = format!("key-{}", seq % args.keys);
        let backend = selector.pick(&PickContext::keyed(&key))?;
        let dispatcher = dispatchers
            .get(&backend.addr)
            .with_context(|| format!("picked unknown backend {}", backend.addr))?;
        dispatcher.schedule(Job::new(key, seq).with_reply(reply.clone()))?;
    }
    drop(reply);

    let mut completed = 0;
    while let Some(result) = results.recv().await {
        match result {
            Ok(_) => completed += 1,
            Err(err) => warn!(error = %err, "simulated job failed"),
        }
    }
    Ok(completed)
}

fn summarize(args: &SimulateArgs, completed: usize, executions: &[Execution]) -> SimulationReport {
    let mut per_node = BTreeMap::new();
    let mut last_seq: HashMap<&str, usize> = HashMap::new();
    let mut owner: HashMap<&str, &str> = HashMap::new();
    let mut ordered = true;
    let mut affine = true;

    for execution in executions {
        *per_node.entry(execution.node.clone()).or_insert(0) += 1;
        if let Some(prev) = last_seq.insert(&execution.key, execution.seq) {
            ordered &= prev < execution.seq;
        }
        let node = *owner.entry(&execution.key).or_insert(&execution.node);
        affine &= node == execution.node;
    }

    SimulationReport {
        nodes: args.nodes,
        keys: args.keys,
        jobs: args.jobs,
        completed,
        per_node,
        ordered,
        affine,
    }
}
