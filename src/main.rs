mod config;
mod database;
mod event;
mod indexer;

use self::{
    config::Config,
    database::{Database, Postgres, Sqlite},
    indexer::{Chain, Indexer, Shutdown},
};
use clap::Parser;
use std::process::ExitCode;
use tokio::signal::unix::{self, SignalKind};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    tracing::info!("{config:#?}");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let eth = ethrpc::http::Client::new(config.rpc_url.clone());

    let (trigger, shutdown) = indexer::channel();
    tokio::spawn(async move {
        match signal().await {
            Ok(()) => trigger.shutdown(),
            Err(err) => {
                tracing::error!(?err, "failed to listen for shutdown signals");
                // Keep the trigger alive, dropping it would stop the indexer.
                futures::future::pending::<()>().await;
            }
        }
    });

    match config.database_url.scheme() {
        "sqlite" => {
            let database = Sqlite::open(&config.database_url)?;
            index(eth, database, &config, shutdown).await
        }
        _ => {
            let database = Postgres::connect(config.database_url.as_str()).await?;
            index(eth, database, &config, shutdown).await
        }
    }
}

async fn index<C, D>(chain: C, database: D, config: &Config, shutdown: Shutdown) -> anyhow::Result<()>
where
    C: Chain,
    D: Database,
{
    tracing::info!(
        network = %config.network, contract = ?config.contract_address,
        "indexing summons"
    );
    let mut indexer = Indexer::create(chain, database, config.contract_address, config.run())?;
    indexer.run(shutdown).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn signal() -> std::io::Result<()> {
    let mut interrupt = unix::signal(SignalKind::interrupt())?;
    let mut terminate = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT, shutting down"),
        _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
