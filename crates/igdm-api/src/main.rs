//! HTTP API server for igdm.

mod auth;
mod routes;

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use log::info;

use igdm_core::{AppConfig, AppPaths, OutreachService};

use crate::routes::{AppState, create_router};

fn main() -> anyhow::Result<()> {
    try_main()
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::discover(cli.common.config.as_deref())?;
    let config = AppConfig::load(&paths, false)?.with_port_env();
    let paths = paths.apply_overrides(&config)?;
    init_logging(&config)?;
    paths.ensure_directories()?;

    let service = OutreachService::from_config(&config, &paths)
        .context("initialising outreach service")?;
    let api_key = std::env::var("SECRET_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
        .map(Arc::from);
    if api_key.is_none() {
        log::warn!("SECRET_KEY is not set; /api routes are unauthenticated");
    }

    let app = create_router(AppState { service, api_key });

    let port = cli.common.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{port}", config.server.bind_address)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address))?;
    info!("Starting API server on {addr}");
    info!("Data directory: {}", paths.data_dir.display());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server stopped");
    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.to_string()),
    );

    if let Some(file) = &config.logging.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .with_context(|| format!("opening log file {file}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().or_else(|err| {
        eprintln!("logger already initialized: {err}");
        Ok(())
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[derive(Debug, Parser)]
#[command(author, version, about = "HTTP API server for igdm outreach tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Port to listen on (defaults to PORT, then server.port)
    #[arg(short, long)]
    port: Option<u16>,
}
