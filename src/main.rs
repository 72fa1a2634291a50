use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use xdis::{logging, Config, MemoryStorage, Server, Service};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "xdis")]
#[command(version)]
#[command(about = "RESP command front-end with Codis slot migration", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (default: 127.0.0.1)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Bind port (default: 6666)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long)]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // CLI arguments override config file
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.logging.level);

    info!(version = VERSION, "starting xdis");
    let storage = MemoryStorage::new(config.storage.databases, config.storage.slot_count);
    info!(
        databases = config.storage.databases,
        slot_count = config.storage.slot_count,
        "using in-memory storage"
    );

    let service = Arc::new(Service::new(Arc::new(storage), config.service_options()));
    let addr = config.addr();
    let server = Server::bind(service, &addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("bye");
    Ok(())
}
