mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetsync_extract::{decode_extract, ExtractLayout};
use fleetsync_storage::{ExtractSource, FtpConfig, FtpExtractSource, LocalDirSource, LocalFileSource};
use fleetsync_sync::{connect_store, BatchSummary, SyncConfig, SyncError, SyncPipeline};
use tracing::{error, info, warn};

use crate::logging::{init_logging, LogConfig};

#[derive(Debug, Parser)]
#[command(name = "fleetsync")]
#[command(about = "Reconciles the fleet driver extract into the tracking database")]
struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the newest extract from the FTP server and reconcile it.
    Sync,
    /// Reconcile an extract from the local filesystem.
    Import {
        #[arg(long, conflicts_with = "dir", required_unless_present = "dir")]
        file: Option<PathBuf>,
        /// Takes the most recently modified file of the directory.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Parse an extract and report rejected lines without touching the database.
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = match LogConfig::from_env(cli.verbose) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("logging configuration error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("could not initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fleetsync failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync => {
            let ftp = FtpConfig::from_env()?;
            info!(host = %ftp.host, dir = %ftp.directory, "using ftp source");
            reconcile(&FtpExtractSource::new(ftp)).await
        }
        Commands::Import { file, dir } => match (file, dir) {
            (Some(file), _) => reconcile(&LocalFileSource::new(file)).await,
            (None, Some(dir)) => reconcile(&LocalDirSource::new(dir)).await,
            (None, None) => anyhow::bail!("import needs --file or --dir"),
        },
        Commands::Check { path } => check(path).await,
    }
}

async fn reconcile(source: &dyn ExtractSource) -> Result<()> {
    let config = SyncConfig::load()?;
    info!(
        tenant_id = config.reconcile.tenant_id,
        watched = config.reconcile.watch_vehicles.len(),
        "configuration loaded"
    );

    // The store comes first: without it nothing can be reconciled.
    let store = connect_store(&config).await?;
    let pipeline = SyncPipeline::new(config, Box::new(store.clone()));
    let result = pipeline.run_once(source).await;
    store.close().await;

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(SyncError::ConnectionLost {
            line_number,
            unprocessed,
            error,
            summary,
        }) => {
            print_summary(&summary);
            anyhow::bail!(
                "store connection lost at line {line_number}, {unprocessed} line(s) not processed: {error}"
            )
        }
        Err(err) => Err(err.into()),
    }
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "sync complete: run_id={} source={} lines={} committed={} skipped={} failed={} inserted={} updated={} ambiguous={}",
        summary.run_id,
        summary.source.as_deref().unwrap_or("-"),
        summary.total_lines,
        summary.committed,
        summary.skipped,
        summary.failed,
        summary.drivers_inserted,
        summary.drivers_updated,
        summary.ambiguous_matches,
    );
}

async fn check(path: PathBuf) -> Result<()> {
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let decoded = decode_extract(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    let layout = match SyncConfig::load() {
        Ok(config) => config.reconcile.layout,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "configuration unreadable, using the default layout");
            ExtractLayout::default()
        }
    };
    let report = layout.check(&decoded);

    for (line, reason) in &report.rejected {
        println!("line {line}: {reason}");
    }
    println!(
        "check complete: encoding={:?} lines={} parsed={} rejected={} without_national_id={} placeholder_drivers={}",
        decoded.encoding,
        report.total_lines,
        report.parsed,
        report.rejected.len(),
        report.without_national_id,
        report.placeholder_drivers,
    );
    Ok(())
}
