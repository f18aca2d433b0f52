//! changestream-migration - live collection migration tool
//!
//! Drives one migration step per invocation. A wrapping script runs the
//! steps in order and stops at the first non-zero exit.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use changestream_migration::{
    checkpoint, mongo, preflight, CaptureEngine, CheckpointStore, LogFormat, MigrationConfig,
    MongoDestination, MongoSource, MongoStagingLog, Namespace, PrimingController, ReplayEngine,
};

/// changestream-migration - capture, stage and replay collection changes
#[derive(Parser, Debug)]
#[command(name = "changestream-migration")]
#[command(author, version, about = "Live collection migration over change streams")]
struct Cli {
    /// TOML configuration file; flags and environment override it
    #[arg(long, short, global = true, env = "MIGRATION_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Source connection string
    #[arg(long, global = true, env = "MIGRATION_SOURCE_URI")]
    src: Option<String>,

    /// Destination connection string
    #[arg(long, global = true, env = "MIGRATION_DEST_URI")]
    dest: Option<String>,

    /// Database name
    #[arg(long, global = true, env = "MIGRATION_DB")]
    db: Option<String>,

    /// Collection name
    #[arg(long, global = true, env = "MIGRATION_COLL")]
    coll: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the source collection has at least one document
    #[command(alias = "checkForDocs")]
    CheckForDocs,

    /// Verify a resume position has been saved
    #[command(alias = "checkTokenFile")]
    CheckTokenFile,

    /// Mutate a source document and save the resulting resume position
    #[command(alias = "primeAndWait")]
    PrimeAndWait,

    /// Only perform the priming mutation (a waiter runs elsewhere)
    #[command(alias = "triggerOnly")]
    TriggerOnly,

    /// Wait for a priming mutation triggered elsewhere and save its position
    #[command(alias = "awaitPrime")]
    AwaitPrime,

    /// Capture source changes into the staging log
    Cdc,

    /// Replay staged changes onto the destination
    Cdr {
        /// Exit once no pending records remain instead of polling
        #[arg(long)]
        drain: bool,
    },

    /// Show checkpoint and staging progress
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MigrationConfig> {
    let mut config = match &cli.config {
        Some(path) => MigrationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MigrationConfig::default(),
    };

    let target = &cli.target;
    if let Some(src) = &target.src {
        config.source_uri = src.clone();
    }
    if let Some(dest) = &target.dest {
        config.destination_uri = dest.clone();
    }
    if let Some(db) = &target.db {
        config.database = db.clone();
    }
    if let Some(coll) = &target.coll {
        config.collection = coll.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &MigrationConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

/// Stop signal wired to Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(command: Commands, config: MigrationConfig) -> anyhow::Result<()> {
    let ns = config.namespace();

    match command {
        Commands::CheckForDocs => {
            let source = connect_source(&config).await?;
            let key = preflight::check_for_docs(&source).await?;
            println!("{}: documents present (anchor {})", ns, key);
        }

        Commands::CheckTokenFile => {
            let checkpoint = checkpoint::open(&config.checkpoint, &ns).await?;
            let result = preflight::check_checkpoint(&checkpoint).await;
            checkpoint.close().await;
            println!("{}: resume position {}", ns, result?);
        }

        Commands::PrimeAndWait => {
            let source = connect_source(&config).await?;
            let checkpoint = checkpoint::open(&config.checkpoint, &ns).await?;
            let result = PrimingController::from_config(&config)
                .prime_and_wait(&source, &source, &checkpoint, shutdown_signal())
                .await;
            checkpoint.close().await;
            println!("{}: primed at {}", ns, result?);
        }

        Commands::TriggerOnly => {
            let source = connect_source(&config).await?;
            PrimingController::from_config(&config)
                .trigger_only(&source)
                .await?;
            println!("{}: priming mutation triggered", ns);
        }

        Commands::AwaitPrime => {
            let source = connect_source(&config).await?;
            let checkpoint = checkpoint::open(&config.checkpoint, &ns).await?;
            let result = PrimingController::from_config(&config)
                .await_trigger(&source, &checkpoint, shutdown_signal())
                .await;
            checkpoint.close().await;
            println!("{}: primed at {}", ns, result?);
        }

        Commands::Cdc => {
            let source = connect_source(&config).await?;
            let client = connect_destination(&config, &[config.staging_namespace()]).await?;
            let log = staging_log(&client, &config).await?;
            let engine = CaptureEngine::from_config(&config)?;
            let checkpoint = checkpoint::open(&config.checkpoint, &ns).await?;

            let result = engine
                .run(&source, &checkpoint, &log, shutdown_signal())
                .await;
            checkpoint.close().await;
            let summary = result?;
            info!(
                staged = summary.staged,
                skipped = summary.skipped,
                resubscribes = summary.resubscribes,
                "Capture finished"
            );
        }

        Commands::Cdr { drain } => {
            let client =
                connect_destination(&config, &[config.staging_namespace(), ns.clone()]).await?;
            let log = staging_log(&client, &config).await?;
            let destination = MongoDestination::new(client);

            let engine = ReplayEngine::from_config(&config);
            let summary = if drain {
                engine.drain(&log, &destination).await?
            } else {
                engine.run(&log, &destination, shutdown_signal()).await?
            };
            info!(
                applied = summary.applied,
                noops = summary.noops,
                exceptions = summary.exceptions,
                "Replay finished"
            );
        }

        Commands::Status => {
            let client = connect_destination(&config, &[config.staging_namespace()]).await?;
            let log = staging_log(&client, &config).await?;
            let checkpoint = checkpoint::open(&config.checkpoint, &ns).await?;
            let result = preflight::status(&checkpoint, &log).await;
            checkpoint.close().await;
            println!("{}", result?);
        }
    }

    Ok(())
}

async fn connect_source(config: &MigrationConfig) -> anyhow::Result<MongoSource> {
    let ns = config.namespace();
    let client = mongo::connect_checked(
        &config.source_uri,
        config.connect.timeout_duration(),
        std::slice::from_ref(&ns),
    )
    .await
    .context("connecting to source")?;
    Ok(MongoSource::new(&client, ns).with_full_document_lookup(config.capture.full_document_lookup))
}

/// Connect to the destination and require majority reads on `namespaces`.
async fn connect_destination(
    config: &MigrationConfig,
    namespaces: &[Namespace],
) -> anyhow::Result<mongodb::Client> {
    mongo::connect_checked(
        &config.destination_uri,
        config.connect.timeout_duration(),
        namespaces,
    )
    .await
    .context("connecting to destination")
}

async fn staging_log(
    client: &mongodb::Client,
    config: &MigrationConfig,
) -> anyhow::Result<MongoStagingLog> {
    let log = MongoStagingLog::new(client, &config.database, &config.staging.collection);
    log.ensure_indexes().await?;
    Ok(log)
}
