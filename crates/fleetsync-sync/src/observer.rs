//! Reporter interface for line-level batch events.

use fleetsync_core::{DriverCandidate, ExtractRecord, LineRejection};
use tracing::{error, info, warn};

use crate::batch::LineFailure;
use crate::reconcile::{DriverWrite, ReconcileOutcome};
use crate::store::StoreError;

/// Receives every observable outcome of a batch, in input order.
pub trait SyncObserver: Send + Sync {
    fn line_skipped(&self, line: usize, reason: &LineRejection);

    fn vehicle_watched(&self, record: &ExtractRecord);

    fn ambiguous_match(&self, record: &ExtractRecord, candidates: &[DriverCandidate]);

    fn line_committed(&self, record: &ExtractRecord, outcome: &ReconcileOutcome);

    fn line_failed(&self, failure: &LineFailure);

    fn batch_aborted(&self, line: usize, unprocessed: usize, error: &StoreError);
}

#[derive(Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn line_skipped(&self, _line: usize, _reason: &LineRejection) {}
    fn vehicle_watched(&self, _record: &ExtractRecord) {}
    fn ambiguous_match(&self, _record: &ExtractRecord, _candidates: &[DriverCandidate]) {}
    fn line_committed(&self, _record: &ExtractRecord, _outcome: &ReconcileOutcome) {}
    fn line_failed(&self, _failure: &LineFailure) {}
    fn batch_aborted(&self, _line: usize, _unprocessed: usize, _error: &StoreError) {}
}

/// Renders batch events as structured log records.
#[derive(Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn line_skipped(&self, line: usize, reason: &LineRejection) {
        warn!(line, %reason, "line skipped");
    }

    fn vehicle_watched(&self, record: &ExtractRecord) {
        warn!(
            line = record.line_number,
            vehicle_id = record.vehicle_id,
            plate = %record.vehicle_plate,
            "[MONITOR] watched vehicle present in extract"
        );
    }

    fn ambiguous_match(&self, record: &ExtractRecord, candidates: &[DriverCandidate]) {
        warn!(
            line = record.line_number,
            name = %record.driver.name,
            candidates = ?candidates.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "several drivers match this name, creating a new driver instead"
        );
    }

    fn line_committed(&self, record: &ExtractRecord, outcome: &ReconcileOutcome) {
        for table in &outcome.unmatched_tables {
            warn!(
                line = record.line_number,
                vehicle_id = record.vehicle_id,
                table = *table,
                "update matched no row"
            );
        }
        let action = match outcome.driver_write {
            DriverWrite::Updated => "updated",
            DriverWrite::Inserted => "inserted",
        };
        info!(
            line = record.line_number,
            vehicle_id = record.vehicle_id,
            driver_id = outcome.driver_id,
            name = %record.driver.name,
            national_id = record.driver.national_id.as_ref().map(|id| id.as_str()),
            action,
            "transaction committed"
        );
    }

    fn line_failed(&self, failure: &LineFailure) {
        error!(
            line = failure.line_number,
            vehicle_id = failure.vehicle_id,
            name = %failure.driver_name,
            national_id = failure.national_id.as_deref(),
            error = %failure.error,
            "transaction rolled back"
        );
    }

    fn batch_aborted(&self, line: usize, unprocessed: usize, error: &StoreError) {
        error!(line, unprocessed, %error, "store connection lost, aborting batch");
    }
}
