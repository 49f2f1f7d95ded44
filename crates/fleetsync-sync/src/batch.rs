//! Batch driver: runs parse → resolve → reconcile over every line in input
//! order and owns the line-level failure boundary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fleetsync_extract::TextEncoding;
use serde::Serialize;
use tokio::fs;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::observer::SyncObserver;
use crate::reconcile::{reconcile_record, DriverWrite, WriteStep};
use crate::resolver::Resolution;
use crate::store::{ReconcileStore, StoreError};

/// Diagnostic record of a line whose transaction was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineFailure {
    pub line_number: usize,
    pub vehicle_id: i64,
    pub driver_name: String,
    pub national_id: Option<String>,
    pub step: WriteStep,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchAbort {
    pub line_number: usize,
    /// Lines not processed, the interrupted one included.
    pub unprocessed: usize,
    pub error: StoreError,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: Option<String>,
    pub source_sha256: Option<String>,
    pub encoding: Option<TextEncoding>,
    pub total_lines: usize,
    pub committed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub drivers_inserted: usize,
    pub drivers_updated: usize,
    pub ambiguous_matches: usize,
    pub unmatched_vehicle_updates: usize,
    pub failures: Vec<LineFailure>,
    pub aborted: Option<BatchAbort>,
}

impl BatchSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            source: None,
            source_sha256: None,
            encoding: None,
            total_lines: 0,
            committed: 0,
            skipped: 0,
            failed: 0,
            drivers_inserted: 0,
            drivers_updated: 0,
            ambiguous_matches: 0,
            unmatched_vehicle_updates: 0,
            failures: Vec::new(),
            aborted: None,
        }
    }

    pub fn processed(&self) -> usize {
        self.committed + self.skipped + self.failed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Writes `<reports_dir>/<run_id>/summary.json`.
    pub async fn write_report(&self, reports_dir: &Path) -> anyhow::Result<PathBuf> {
        let run_dir = reports_dir.join(self.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("summary.json");
        let bytes = serde_json::to_vec_pretty(self).context("serializing batch summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub struct BatchDriver<'a> {
    store: &'a dyn ReconcileStore,
    config: &'a ReconcileConfig,
    observer: &'a dyn SyncObserver,
}

impl<'a> BatchDriver<'a> {
    pub fn new(
        store: &'a dyn ReconcileStore,
        config: &'a ReconcileConfig,
        observer: &'a dyn SyncObserver,
    ) -> Self {
        Self {
            store,
            config,
            observer,
        }
    }

    /// Processes numbered lines strictly in order. Line-level problems are
    /// recorded and skipped; losing the store connection stops the batch.
    pub async fn run<'l, I>(&self, lines: I) -> BatchSummary
    where
        I: IntoIterator<Item = (usize, &'l str)>,
    {
        let mut summary = BatchSummary::start();
        let mut lines = lines.into_iter();

        while let Some((line_number, raw)) = lines.next() {
            summary.total_lines += 1;

            let record = match self.config.layout.parse_line(line_number, raw) {
                Ok(record) => record,
                Err(reason) => {
                    summary.skipped += 1;
                    self.observer.line_skipped(line_number, &reason);
                    continue;
                }
            };

            if self.config.watch_vehicles.contains(&record.vehicle_id) {
                self.observer.vehicle_watched(&record);
            }

            let span = info_span!("line", line = line_number, vehicle_id = record.vehicle_id);
            let result = reconcile_record(self.store, self.config.tenant_id, &record, self.observer)
                .instrument(span)
                .await;

            match result {
                Ok(outcome) => {
                    summary.committed += 1;
                    match outcome.driver_write {
                        DriverWrite::Inserted => summary.drivers_inserted += 1,
                        DriverWrite::Updated => summary.drivers_updated += 1,
                    }
                    if matches!(outcome.resolution, Resolution::Ambiguous { .. }) {
                        summary.ambiguous_matches += 1;
                    }
                    summary.unmatched_vehicle_updates += outcome.unmatched_tables.len();
                    self.observer.line_committed(&record, &outcome);
                }
                Err(err) if err.source.is_connection_loss() => {
                    let abort = BatchAbort {
                        line_number,
                        unprocessed: 1 + lines.by_ref().count(),
                        error: err.source,
                    };
                    summary.total_lines += abort.unprocessed - 1;
                    self.observer
                        .batch_aborted(abort.line_number, abort.unprocessed, &abort.error);
                    summary.aborted = Some(abort);
                    break;
                }
                Err(err) => {
                    summary.failed += 1;
                    let failure = LineFailure {
                        line_number,
                        vehicle_id: record.vehicle_id,
                        driver_name: record.driver.name.clone(),
                        national_id: record.driver.national_id.as_ref().map(|id| id.to_string()),
                        step: err.step,
                        error: err.to_string(),
                    };
                    self.observer.line_failed(&failure);
                    summary.failures.push(failure);
                }
            }
        }

        summary.finished_at = Utc::now();
        summary
    }
}
