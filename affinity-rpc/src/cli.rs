use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::NodeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON node configuration; every field has a default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the node each key maps to on a consistent-hash ring.
    Route(RouteArgs),
    /// Run a fleet of in-process nodes and route keyed jobs across it.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RouteArgs {
    /// Node identifier to place on the ring. Repeat for each node.
    #[arg(long = "node", required = true)]
    pub nodes: Vec<String>,

    /// Key to look up. Repeat for each key.
    #[arg(long = "key", required = true)]
    pub keys: Vec<String>,

    /// Virtual slots per node; overrides the config file.
    #[arg(long)]
    pub replicas: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of serving nodes.
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,

    /// Number of distinct routing keys.
    #[arg(long, default_value_t = 8)]
    pub keys: usize,

    /// Number of jobs routed across the keys round-robin.
    #[arg(long, default_value_t = 64)]
    pub jobs: usize,

    /// Service name the nodes register under.
    #[arg(long, default_value = "sim")]
    pub service: String,

    /// Soft worker ceiling per node; overrides the config file.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Idle worker watermark per node; overrides the config file.
    #[arg(long)]
    pub max_idle: Option<usize>,

    /// Lease TTL in milliseconds; overrides the config file.
    #[arg(long)]
    pub ttl_ms: Option<u64>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RouteArgs {
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(replicas) = self.replicas {
            config.ring.replicas = replicas;
        }
    }
}

impl SimulateArgs {
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(max_workers) = self.max_workers {
            config.dispatch.max_workers = max_workers;
        }
        if let Some(max_idle) = self.max_idle {
            config.dispatch.max_idle = max_idle;
        }
        if let Some(ttl_ms) = self.ttl_ms {
            config.registry.ttl_ms = ttl_ms;
        }
    }
}
