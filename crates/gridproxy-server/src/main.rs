use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gridproxy_server::bus::{NodeClient, RelayBus};
use gridproxy_server::cli::Cli;
use gridproxy_server::{build_version, serve, AppState, NodeManager, PostgresDatabase};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Lifetime of a bus message before the relay drops it.
const BUS_MESSAGE_TTL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", build_version());
        return Ok(());
    }
    let config = cli.load_config()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!(version = %build_version(), "grid proxy starting");
    if config.no_cert {
        tracing::info!("serving plain HTTP, TLS is terminated in front of the gateway");
    } else {
        tracing::warn!("no certificate handling built in, terminate TLS in front of the gateway or pass --no-cert");
    }

    let addr = config.listen_addr()?;
    let db = Arc::new(
        PostgresDatabase::connect(&config.postgres)
            .await
            .context("connecting to postgres")?,
    );

    let shutdown = CancellationToken::new();
    let mut state = AppState::new(db.clone(), build_version());
    let mut refresher = None;

    match &config.relay_url {
        Some(url) => {
            let bus = RelayBus::new(url, config.bus_twin_id, BUS_MESSAGE_TTL)?;
            let client = NodeClient::new(Arc::new(bus));
            state = state.with_node_client(client.clone(), config.refresher.rpc_timeout());

            let manager = NodeManager::new(db.clone(), client, config.refresher.clone());
            refresher = Some(tokio::spawn(manager.run(shutdown.clone())));
        }
        None => tracing::warn!("no relay configured, node telemetry will not be refreshed"),
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "couldn't listen for shutdown signal");
            return;
        }
        tracing::info!("shutting down");
        signal.cancel();
    });

    let served = serve(addr, Arc::new(state), shutdown.clone()).await;
    shutdown.cancel();
    if let Some(handle) = refresher {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "refresher task failed");
        }
    }
    served
}
