//! `tracewire` binary entry point: loads config, wires up ambient logging,
//! and runs the proxy engine until a SIGINT triggers a graceful shutdown.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracewire::engine::ProxyEngine;
use tracewire::jsonl_tracing_layer::JsonlTracingLayer;
use tracewire::log_writer::LogWriter;
use tracewire::EngineConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracewire", about = "TLS-intercepting tracer proxy")]
struct Cli {
    /// Path to a JSON config file (spec.md §6). Falls back to environment
    /// variables and built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port from the config file or environment.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let log_writer = Arc::new(
        LogWriter::from_env().map_err(|e| anyhow::anyhow!("failed to create LogWriter: {e}"))?,
    );
    let jsonl_layer = JsonlTracingLayer::new(log_writer.as_ref().clone());

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(jsonl_layer)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_env(),
    };

    if let Some(port) = cli.port {
        config.proxy_server.set_port(port);
    }

    let engine = Arc::new(ProxyEngine::with_defaults(config)?);

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            ctrl_c_shutdown.cancel();
        }
    });

    engine.run(shutdown).await?;

    Ok(())
}
