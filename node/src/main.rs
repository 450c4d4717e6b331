// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Import;
use palisade_node::{generate_localnet, Node, NodeConfig};
use prometheus::Registry;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[clap(name = "palisade-node", about = "A BFT state machine replication node")]
struct Args {
    /// This node's id within the committee.
    #[clap(long, default_value_t = 0)]
    node_id: u64,

    /// One of `server` (alias `replica`), `client` or `generate`.
    #[clap(long, default_value = "server")]
    role: String,

    /// Path to this node's YAML config file.
    #[clap(long, default_value = "node.yaml")]
    config: PathBuf,

    /// With `--role generate`: replicas to include.
    #[clap(long, default_value_t = 4)]
    replicas: usize,

    /// With `--role generate`: clients to include.
    #[clap(long, default_value_t = 1)]
    clients: usize,

    /// With `--role generate`: first port of the localnet.
    #[clap(long, default_value_t = 9300)]
    base_port: u16,

    /// With `--role generate`: output directory.
    #[clap(long, default_value = ".")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.role.as_str() {
        "generate" => {
            let paths = generate_localnet(args.replicas, args.clients, args.base_port, &args.output)
                .context("failed to generate localnet configs")?;
            for path in paths {
                info!("wrote {}", path.display());
            }
            Ok(())
        }
        "server" | "replica" => {
            let config = NodeConfig::import(&args.config)
                .with_context(|| format!("failed to load {}", args.config.display()))?;
            let registry = Registry::new();
            let (handles, shutdown) =
                Node::spawn_replica(args.node_id, &config, &registry).await?;
            wait_for_done(config.parameters.done_timer_ms).await;
            shutdown.send().context("shutdown channel dropped")?;
            futures::future::join_all(handles).await;
            info!("replica {} exited cleanly", args.node_id);
            Ok(())
        }
        "client" => {
            let config = NodeConfig::import(&args.config)
                .with_context(|| format!("failed to load {}", args.config.display()))?;
            let (handles, shutdown) = Node::spawn_client(args.node_id, &config).await?;
            wait_for_done(config.parameters.done_timer_ms).await;
            shutdown.send().context("shutdown channel dropped")?;
            futures::future::join_all(handles).await;
            info!("client {} exited cleanly", args.node_id);
            Ok(())
        }
        other => bail!("unknown role '{other}'"),
    }
}

/// Runs for the configured duration, or until interrupted when no
/// duration is set.
async fn wait_for_done(done_timer_ms: u64) {
    if done_timer_ms == 0 {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted, shutting down");
    } else {
        tokio::time::sleep(Duration::from_millis(done_timer_ms)).await;
        info!("done timer elapsed, shutting down");
    }
}
