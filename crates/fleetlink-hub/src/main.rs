//! `fleetlink` binary: run the hub or validate its config.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use fleetlink_hub::config::{check_config, default_config_path, load_config};
use fleetlink_hub::{server, Hub};
use fleetlink_types::config::{HubConfig, LogFormat};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &HubConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => cmd_check_config(cli.config.as_deref()),
        Commands::Run => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(listen) = cli.listen {
                config.listen_addr = listen;
            }
            init_tracing(&config);
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(cmd_run(config))
        }
    }
}

fn cmd_check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let config = check_config(&path).with_context(|| format!("{} is not usable", path.display()))?;
    println!(
        "{}: ok ({} peer{})",
        path.display(),
        config.peers.len(),
        if config.peers.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

async fn cmd_run(config: HubConfig) -> anyhow::Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("invalid configuration: {}", problems.join("; "));
    }

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    if config.api_key.is_empty() {
        tracing::warn!("No api_key configured, /api/* is unauthenticated");
    }

    let hub = Hub::new(config);
    hub.start().await;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    };
    let served = server::serve(std::sync::Arc::clone(&hub), listener, shutdown).await;
    hub.shutdown().await;
    served.context("hub API server failed")
}
