use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use libspectate::{Broker, StoreKind};
use spectate_server::{AppState, ServerConfig, build_cors, router};

#[derive(Parser, Debug)]
#[command(name = "spectate-server", about = "Session broker for render workers", version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/spectate/config.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// State store backend
    #[arg(long, value_enum)]
    store: Option<StoreArg>,

    /// SQLite state file (implies --store sqlite)
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Allowed CORS origin, repeatable; "*" allows any
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreArg {
    Memory,
    Sqlite,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(store) = self.store {
            config.broker.store.kind = match store {
                StoreArg::Memory => StoreKind::Memory,
                StoreArg::Sqlite => StoreKind::Sqlite,
            };
        }
        if let Some(path) = self.sqlite_path {
            config.broker.store.kind = StoreKind::Sqlite;
            config.broker.store.path = Some(path);
        }
        if !self.allow_origins.is_empty() {
            config.allow_origins = self.allow_origins;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spectate_server=info,libspectate=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let broker = Broker::open(&config.broker).context("failed to open broker")?;
    broker
        .seed_slots()
        .await
        .context("failed to register configured slots")?;

    let shutdown = CancellationToken::new();
    let loops = broker.supervisor().spawn(shutdown.clone());

    let cors = build_cors(&config.allow_origins)?;
    let app = router(AppState::new(broker, shutdown.clone()), cors);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    tracing::info!(
        store = ?config.broker.store.kind,
        "spectate-server listening on http://{}",
        config.listen
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
            }
            tracing::info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in loops {
        let _ = handle.await;
    }
    Ok(())
}
