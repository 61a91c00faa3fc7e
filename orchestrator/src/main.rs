// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use ledger_orchestrator::config::EngineConfig;
use ledger_orchestrator::ledger_client::JsonRpcLedgerClient;
use ledger_orchestrator::metrics::start_metrics_server;
use ledger_orchestrator::scheduler::TokioScheduler;
use ledger_orchestrator::Engine;
use ledger_orchestrator_config::Config;
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::load(&args.config_path)?;
    info!("Loaded config from {:?}", args.config_path);

    let registry = Registry::new();
    if let Some(port) = config.metrics_port {
        let metrics_address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
        start_metrics_server(metrics_address, registry.clone()).await?;
    }

    let client = Arc::new(JsonRpcLedgerClient::new(config.rpc_url.clone())?);
    let engine = Engine::new(config, client, Arc::new(TokioScheduler), &registry)?;
    let handles = engine.start();

    tokio::signal::ctrl_c().await?;
    engine.stop();
    for handle in handles {
        handle
            .await
            .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
    }
    Ok(())
}
