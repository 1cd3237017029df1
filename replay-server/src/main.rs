//! Replay server - hosts the priority tables and their streaming endpoints

use anyhow::{Context, Result};
use clap::Parser;
use replay_proto::ServerInfoRequest;
use replay_server::{ConfigManager, ReplayService};
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Experience replay server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file merged over the built-in defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = match &cli.config {
        Some(path) => {
            if !path.exists() {
                warn!(path = %path.display(), "config file not found, using defaults");
            }
            ConfigManager::load_with_path(path)?
        }
        None => ConfigManager::defaults()?,
    };
    let config = manager.config();

    let service = ReplayService::create(config.build_tables(), None, config.service.clone())
        .context("failed to initialize replay service")?;
    info!("{service}");

    let server_info = service
        .server_info(ServerInfoRequest {})
        .await
        .context("failed to query server info")?;
    for table in &server_info.table_info {
        info!(
            table = %table.name,
            max_size = table.max_size,
            current_size = table.current_size,
            "table ready"
        );
    }
    info!(
        tables_state_id = %format!("{:032x}", service.tables_state_id()),
        "replay service started, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    service.close();
    Ok(())
}
