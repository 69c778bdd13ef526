mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tensorloom_server::{activate, load_repository, router, AppState, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            http_addr,
            repository,
            log,
        } => serve(config, http_addr, repository, log).await,
    }
}

async fn serve(
    config: Option<PathBuf>,
    http_addr: Option<String>,
    repository: Option<PathBuf>,
    log: String,
) -> Result<()> {
    std::env::set_var("RUST_LOG", &log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut settings = Settings::load(config.as_deref())?;
    if let Some(addr) = http_addr {
        settings.http_addr = addr;
    }
    if let Some(root) = repository {
        settings.repository = root;
    }

    let repo = load_repository(&settings.repository)?;
    let pipelines = activate(repo, Duration::from_millis(settings.batch_delay_ms))?;

    let state = Arc::new(AppState { pipelines });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.http_addr))?;
    tracing::info!(addr = %settings.http_addr, "tensorloomd HTTP listening");
    axum::serve(listener, app).await?;

    Ok(())
}
