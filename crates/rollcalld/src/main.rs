use anyhow::{Context, Result};
use clap::Parser;
use rollcall_core::{Config, OnnxProvider};
use rollcall_hw::{open_first_available, Camera};
use rollcall_store::FaceStore;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod engine;
mod error;
mod routes;

#[derive(Parser)]
#[command(name = "rollcalld", about = "Rollcall web front-end")]
struct Args {
    /// Address to bind (default 0.0.0.0)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (default 5000)
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding person_details.csv and face_encodings.bin
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Start with the lenient tolerance
    #[arg(long)]
    lenient: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let provider = OnnxProvider::load(&config.model_dir)?;
    let store = FaceStore::open(&config.data_dir)
        .with_context(|| format!("failed to open data directory {}", config.data_dir.display()))?;

    let indices = config.camera_indices.clone();
    let options = engine::EngineOptions::from_config(&config, args.lenient);
    let engine = engine::spawn_engine(
        move || open_first_available(&indices, Camera::open_index).map(|(_, camera)| camera),
        provider,
        store,
        options,
    )
    .await?;

    let app = routes::router(engine);
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %listener.local_addr()?, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
    }
}
