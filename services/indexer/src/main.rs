//! Marketplace event indexer daemon.
//!
//! # Usage
//!
//! ```bash
//! # Settings file plus optional secrets overlay
//! indexer --config appsettings.json --secrets secrets.json
//!
//! # Everything on the command line
//! indexer \
//!     --subgraph-url http://graph-node:8000/subgraphs/name/marketplace \
//!     --orderbook-url http://orderbook:3000 \
//!     --database ./data/indexer.db \
//!     --status-addr 0.0.0.0:8080
//! ```
//!
//! Ctrl+C stops the timers, lets in-flight cycles finish, and exits.

use anyhow::{Context, Result};
use clap::Parser;
use indexer::config::IndexerConfig;
use indexer::delivery::{Forwarder, OrderbookClient};
use indexer::ingestion::Ingestor;
use indexer::metrics::IndexerMetrics;
use indexer::reconcile::ReconciliationSweep;
use indexer::scheduler::Scheduler;
use indexer::status::{create_router, StatusState};
use indexer::store::{EventStore, SqliteEventStore};
use indexer::upstream::SubgraphClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use types::event::EventType;

/// Marketplace event indexer.
#[derive(Parser, Debug)]
#[command(name = "indexer")]
#[command(about = "Index marketplace order events and forward them to the orderbook")]
#[command(version)]
struct Args {
    /// JSON settings file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// JSON secrets file, deep-merged over the settings
    #[arg(long)]
    secrets: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Subgraph GraphQL endpoint
    #[arg(long)]
    subgraph_url: Option<String>,

    /// Orderbook service base URL
    #[arg(long)]
    orderbook_url: Option<String>,

    /// Status server bind address
    #[arg(long)]
    status_addr: Option<SocketAddr>,
}

impl Args {
    fn apply(self, config: &mut IndexerConfig) {
        if let Some(path) = self.database {
            config.database_path = path;
        }
        if let Some(url) = self.subgraph_url {
            config.subgraph_url = url;
        }
        if let Some(url) = self.orderbook_url {
            config.orderbook_url = url;
        }
        if let Some(addr) = self.status_addr {
            config.status_addr = Some(addr);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,indexer=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = IndexerConfig::load(args.config.as_deref(), args.secrets.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        version = indexer::SERVICE_VERSION,
        subgraph = %config.subgraph_url,
        orderbook = %config.orderbook_url,
        database = %config.database_path.display(),
        "Indexer starting"
    );

    let store: Arc<dyn EventStore> = Arc::new(
        SqliteEventStore::open(&config.database_path).context("Failed to open event store")?,
    );
    let metrics = Arc::new(IndexerMetrics::new());
    let feed = Arc::new(SubgraphClient::new(
        config.subgraph_url.clone(),
        config.request_timeout(),
    )?);
    let orderbook = Arc::new(OrderbookClient::new(
        config.orderbook_url.clone(),
        config.request_timeout(),
    )?);
    let forwarder = Arc::new(Forwarder::new(orderbook, store.clone(), metrics.clone()));

    let ingestors: Vec<Arc<Ingestor>> = EventType::ALL
        .iter()
        .map(|event_type| {
            Arc::new(Ingestor::new(
                *event_type,
                config.page_size,
                store.clone(),
                feed.clone(),
                forwarder.clone(),
                metrics.clone(),
            ))
        })
        .collect();
    let sweep = Arc::new(ReconciliationSweep::new(
        store.clone(),
        forwarder,
        metrics.clone(),
        config.sweep_batch_size,
    ));

    let shutdown = CancellationToken::new();
    let status_server = match config.status_addr {
        Some(addr) => {
            let state = StatusState {
                ingestors: ingestors.clone(),
                sweep: sweep.clone(),
                store: store.clone(),
                metrics: metrics.clone(),
            };
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind status server to {addr}"))?;
            tracing::info!("Status server listening on {}", addr);

            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, create_router(state))
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
            }))
        }
        None => None,
    };

    let scheduler = Scheduler::new(
        ingestors,
        sweep,
        config.poll_interval(),
        config.sweep_interval(),
    )
    .start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received, stopping gracefully...");

    shutdown.cancel();
    scheduler.shutdown();
    scheduler.join().await;

    if let Some(server) = status_server {
        server.await??;
    }

    tracing::info!("Indexer stopped");
    Ok(())
}
