use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod driver;
mod error;
mod executor;
mod kv;
mod reaper;
mod registry;
mod server;
mod workspace;

use config::Config;
use driver::{ContainerDriver, DockerDriver};
use executor::Executor;
use kv::{KvDirectory, MemoryKv};
use reaper::Reaper;
use registry::SessionRegistry;
use server::AppState;
use workspace::WorkspaceGateway;

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(
    author,
    version,
    about = "Isolated command execution service backed by per-session container sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the background cleanup worker
    Serve {
        /// Listen address (overrides config and BIND_ADDR)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a single cleanup pass and exit
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("sandboxd=debug")
    } else {
        EnvFilter::new("sandboxd=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::load(&cwd)?;
    config.mem_limit_bytes()?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            serve(config).await?;
        }
        Commands::Reap => {
            reap_once(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let (registry, driver, kv) = build_core(&config).await?;

    let executor = Arc::new(Executor::new(
        Arc::clone(&registry),
        Arc::clone(&driver),
        &config,
    ));
    let gateway = Arc::new(WorkspaceGateway::new(
        Arc::clone(&registry),
        Arc::clone(&driver),
        &config,
    ));

    let reaper = Reaper::new(
        Arc::clone(&driver),
        Arc::clone(&kv),
        Arc::clone(&registry),
        &config,
    );
    tokio::spawn(async move { reaper.run_loop().await });

    let state = AppState::new(executor, registry, gateway, kv, driver, &config);
    server::serve(state, &config.server.bind_addr).await
}

async fn reap_once(config: Config) -> Result<()> {
    let (registry, driver, kv) = build_core(&config).await?;
    let reaper = Reaper::new(driver, kv, registry, &config);
    let removed = reaper.run_once().await;
    println!("removed {removed} container(s)");
    Ok(())
}

async fn build_core(
    config: &Config,
) -> Result<(Arc<SessionRegistry>, Arc<dyn ContainerDriver>, Arc<dyn KvDirectory>)> {
    let driver: Arc<dyn ContainerDriver> = Arc::new(
        DockerDriver::connect()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker. Is Docker running? ({e})"))?,
    );
    let kv: Arc<dyn KvDirectory> = Arc::new(MemoryKv::new());
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&driver),
        Arc::clone(&kv),
        config.clone(),
    )?);
    Ok((registry, driver, kv))
}
