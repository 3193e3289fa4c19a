// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use media_downloader::prelude::*;
use media_downloader::server;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Local web front end for downloading media through yt-dlp.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 4050)]
    port: u16,

    /// Settings file (defaults to settings.json in the default download directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// yt-dlp executable
    #[arg(long = "yt-dlp", default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    /// Keep at most this many finished downloads in memory
    #[arg(long)]
    retain_finished: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let settings_store = match args.settings {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::default_location(),
    };
    tracing::info!(path = %settings_store.path().display(), "loading settings");

    let engine: Arc<dyn ExtractionEngine> = Arc::new(YtDlp::new(args.yt_dlp));
    let manager = Arc::new(JobManager::new(settings_store, engine, args.retain_finished).await);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            signal_token.cancel();
        }
    });

    axum::serve(listener, server::router(manager.clone()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    manager.shutdown();
    Ok(())
}
