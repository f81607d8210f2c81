//! practica-server - hosts practice sessions

use anyhow::{Context, Result};
use clap::Parser;
use practica::collab::{Collaborators, InMemoryFeedback};
use practica::config::Config;
use practica::gateway::SessionGateway;
use practica::server::ServerListener;
use practica::session::SessionStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "practica-server")]
#[command(about = "practica session server")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Keep sessions in memory only
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if cli.ephemeral {
        config.server.persist = false;
    }
    practica::logging::init(&config.logging);

    let store = match config.state_dir() {
        Some(dir) => {
            tracing::info!("Storing sessions in {}", dir.display());
            SessionStore::open(&dir)
                .with_context(|| format!("Failed to open session store {}", dir.display()))?
        }
        None => {
            tracing::warn!("Persistence disabled; sessions are lost on restart");
            SessionStore::in_memory()
        }
    };

    let collab = Collaborators::new(
        Arc::new(config.catalog.catalog()),
        Arc::new(InMemoryFeedback::new()),
    );
    if config.auth.tokens.is_empty() && !config.auth.allow_anonymous {
        tracing::warn!("No tokens configured and anonymous access is off; every client will be refused");
    }
    let identity = Arc::new(config.auth.resolver());

    let gateway = SessionGateway::start(store, collab, config.sessions.clone())
        .await
        .context("Failed to restore sessions")?;
    let _liveness = gateway.spawn_liveness_monitor(config.liveness.clone());

    let listener = ServerListener::bind(config.server.bind, gateway, identity).await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    listener.run(shutdown_rx).await
}
