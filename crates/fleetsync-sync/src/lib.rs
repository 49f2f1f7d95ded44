//! Reconciliation pipeline: resolves each extract line to a driver and
//! applies its writes as one isolated transaction.

pub mod batch;
pub mod config;
pub mod memory;
pub mod observer;
pub mod postgres;
pub mod reconcile;
pub mod resolver;
pub mod store;

use fleetsync_extract::decode_extract;
use fleetsync_storage::{ExtractSource, SelectionBasis, StagingArea};
use thiserror::Error;
use tracing::{info, warn};

pub use batch::{BatchAbort, BatchDriver, BatchSummary, LineFailure};
pub use config::{DatabaseConfig, ReconcileConfig, SyncConfig};
pub use memory::MemoryStore;
pub use observer::{NoopObserver, SyncObserver, TracingObserver};
pub use postgres::PgStore;
pub use reconcile::{reconcile_record, DriverWrite, ReconcileOutcome, TransactionError, WriteStep};
pub use resolver::{resolve_driver, MatchTier, Resolution};
pub use store::{ReconcileStore, StoreError, UnitOfWork};

pub const CRATE_NAME: &str = "fleetsync-sync";

/// Conditions that end a batch as a whole.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("store connection lost at line {line_number}; {unprocessed} line(s) not processed: {error}")]
    ConnectionLost {
        line_number: usize,
        unprocessed: usize,
        error: StoreError,
        summary: Box<BatchSummary>,
    },
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Box<dyn ReconcileStore>,
    observer: Box<dyn SyncObserver>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Box<dyn ReconcileStore>) -> Self {
        Self {
            config,
            store,
            observer: Box::<TracingObserver>::default(),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Fetches the latest extract, stages it, reconciles every line and
    /// signals completion to the staging area.
    pub async fn run_once(&self, source: &dyn ExtractSource) -> Result<BatchSummary, SyncError> {
        let fetched = source
            .fetch_latest()
            .await
            .map_err(|err| SyncError::SourceUnavailable(format!("{}: {err}", source.describe())))?;
        if fetched.selection == SelectionBasis::ListingOrder {
            warn!(file = %fetched.file_name, "extract chosen by listing order, verify it is the newest");
        }

        let candidates = match &self.config.staging_dir {
            Some(dir) => vec![dir.clone()],
            None => StagingArea::default_candidates(),
        };
        let staged = match StagingArea::select(&candidates).await {
            Ok(area) => match area.stage(&fetched).await {
                Ok(staged) => Some((area, staged)),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "could not stage extract, continuing from memory");
                    None
                }
            },
            Err(err) => {
                warn!(error = %format!("{err:#}"), "no staging directory, continuing from memory");
                None
            }
        };

        let decoded = decode_extract(&fetched.bytes)
            .map_err(|err| SyncError::SourceUnavailable(format!("{}: {err}", fetched.file_name)))?;
        let sha256 = match &staged {
            Some((_, staged)) => staged.sha256.clone(),
            None => StagingArea::sha256_hex(&fetched.bytes),
        };
        info!(
            file = %fetched.file_name,
            encoding = ?decoded.encoding,
            lines = decoded.line_count(),
            sha256 = %sha256,
            "processing extract"
        );

        let driver = BatchDriver::new(self.store.as_ref(), &self.config.reconcile, self.observer.as_ref());
        let mut summary = driver.run(decoded.lines()).await;
        summary.source = Some(fetched.file_name.clone());
        summary.source_sha256 = Some(sha256);
        summary.encoding = Some(decoded.encoding);

        if let Some(dir) = &self.config.reports_dir {
            match summary.write_report(dir).await {
                Ok(path) => info!(path = %path.display(), "run report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "could not write run report"),
            }
        }

        if let Some((area, staged)) = &staged {
            area.finish(staged, !summary.is_aborted()).await;
        }

        if let Some(abort) = summary.aborted.clone() {
            return Err(SyncError::ConnectionLost {
                line_number: abort.line_number,
                unprocessed: abort.unprocessed,
                error: abort.error,
                summary: Box::new(summary),
            });
        }

        info!(
            run_id = %summary.run_id,
            total = summary.total_lines,
            committed = summary.committed,
            skipped = summary.skipped,
            failed = summary.failed,
            inserted = summary.drivers_inserted,
            updated = summary.drivers_updated,
            "batch finished"
        );
        Ok(summary)
    }
}

/// Connects to the configured database; failure here is batch-fatal.
pub async fn connect_store(config: &SyncConfig) -> Result<PgStore, SyncError> {
    PgStore::connect(&config.database)
        .await
        .map_err(SyncError::StoreUnavailable)
}
