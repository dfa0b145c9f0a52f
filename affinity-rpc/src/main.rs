use anyhow::{Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use affinity_rpc::{
    cli::{Cli, Command},
    commands,
    config::NodeConfig,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Command::Route(args) => {
            args.apply(&mut config);
            for (key, node) in commands::route(&args, &config)? {
                println!("{key} -> {node}");
            }
        }
        Command::Simulate(args) => {
            args.apply(&mut config);
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                    return;
                }
                info!("interrupted, shutting down");
                on_ctrl_c.cancel();
            });

            let report = commands::simulate(&args, &config, cancel).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} jobs over {} keys on {} nodes: {} completed, ordered={}, affine={}",
                    report.jobs,
                    report.keys,
                    report.nodes,
                    report.completed,
                    report.ordered,
                    report.affine
                );
                for (node, count) in &report.per_node {
                    println!("  {node}: {count}");
                }
            }
            if !report.is_consistent() {
                bail!("simulation observed a routing or ordering violation");
            }
        }
    }

    Ok(())
}
