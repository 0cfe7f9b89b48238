use crate::error::CliError;
use clap::{Parser, Subcommand};
use drivers::registry::DriverRegistry;
use engine::{config::PluginConfig, mapping::FnRegistry, plugin::ReplicatorPlugin};
use model::{memory::MemoryStore, store::DocumentStore};
use std::{process, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

mod error;
mod seed;
mod shutdown;

#[derive(Parser)]
#[command(name = "fanout", version = "0.1.0", about = "CDC fan-out replication for document stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication plugin against an embedded store until
    /// SIGINT/SIGTERM.
    Run {
        /// Path to the plugin configuration (JSON).
        #[arg(long)]
        config: String,
        /// Optional seed file: resources, attributes and records to
        /// replay through the pipeline.
        #[arg(long)]
        seed: Option<String>,
    },
    /// Resolve mappings and report findings without touching any
    /// destination.
    Validate {
        #[arg(long)]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `verbose` in the plugin config raises the log level.
    let level = match &cli.command {
        Commands::Run { config, .. } | Commands::Validate { config } => load_config(config)
            .map(|c| if c.verbose { Level::DEBUG } else { Level::INFO })
            .unwrap_or(Level::INFO),
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let exit_code = match run_cli(cli).await {
        Ok(()) => 0,
        Err(CliError::ShutdownRequested) => {
            info!("Application shutdown gracefully");
            130
        }
        Err(e) => {
            error!("Application error: {}", e);
            1
        }
    };

    process::exit(exit_code);
}

fn load_config(path: &str) -> Result<PluginConfig, CliError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn build_registry() -> DriverRegistry {
    // The embedded runner backs `s3db` destinations with in-memory
    // secondary stores.
    DriverRegistry::builtin().with_store_connector(Arc::new(|_config| {
        Ok(Arc::new(MemoryStore::new()) as Arc<dyn DocumentStore>)
    }))
}

async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let cancel = CancellationToken::new();
    let shutdown = shutdown::install_signal_handlers(&cancel);

    match cli.command {
        Commands::Run { config, seed: seed_path } => {
            let config = load_config(&config)?;
            let store = Arc::new(MemoryStore::new());

            let seed_file = seed_path.map(|path| seed::load(&path)).transpose()?;
            if let Some(seed_file) = &seed_file {
                seed::declare_resources(store.as_ref(), seed_file).await?;
            }

            let mut plugin = ReplicatorPlugin::new(
                config,
                store.clone(),
                build_registry(),
                FnRegistry::new(),
            );
            plugin.init().await.map_err(engine::error::EngineError::from)?;

            // Surface bus events through the logger.
            let mut events = plugin.subscribe().await;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if event.is_error() {
                        error!(event_type = event.event_type(), "{event}");
                    } else {
                        info!(event_type = event.event_type(), "{event}");
                    }
                }
            });

            plugin.start().await?;
            for replicator in plugin.replicators() {
                info!(
                    id = %replicator.id,
                    driver = %replicator.driver,
                    enabled = replicator.enabled,
                    resources = ?replicator.resources,
                    "replicator registered"
                );
            }

            if let Some(seed_file) = seed_file {
                seed::apply_records(store.as_ref(), seed_file).await?;
            }

            shutdown.cancelled().await;
            plugin.stop().await;

            let snapshot = plugin.metrics();
            info!(
                replicated = snapshot.replicated,
                failed = snapshot.failed,
                skipped = snapshot.skipped,
                cancelled = snapshot.cancelled,
                "final replication counters"
            );

            Err(CliError::ShutdownRequested)
        }
        Commands::Validate { config } => {
            let config = load_config(&config)?;
            let findings =
                ReplicatorPlugin::validate(&config, &build_registry(), &FnRegistry::new())?;
            if findings.is_empty() {
                info!("configuration valid: no findings");
            } else {
                for finding in &findings {
                    info!(finding = %finding, "validation finding");
                }
            }
            Ok(())
        }
    }
}
