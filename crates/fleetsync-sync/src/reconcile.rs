//! Per-record write set: driver upsert plus the three vehicle-side tables,
//! committed or rolled back as one unit.

use std::fmt;

use fleetsync_core::ExtractRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::observer::SyncObserver;
use crate::resolver::{resolve_driver, Resolution};
use crate::store::{ReconcileStore, StoreError, UnitOfWork};

pub const DRIVER_TABLE: &str = "motorista";
pub const ASSIGNMENT_TABLE: &str = "grid_ext";
pub const VEHICLE_TABLE: &str = "cad_veiculo";
pub const SYNC_MARKER_TABLE: &str = "last_datastore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStep {
    Begin,
    Resolve,
    UpdateDriver,
    InsertDriver,
    AssignVehicle,
    UpdatePlate,
    TouchSyncMarker,
    Commit,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteStep::Begin => "begin",
            WriteStep::Resolve => "resolve",
            WriteStep::UpdateDriver => "update_driver",
            WriteStep::InsertDriver => "insert_driver",
            WriteStep::AssignVehicle => "assign_vehicle",
            WriteStep::UpdatePlate => "update_plate",
            WriteStep::TouchSyncMarker => "touch_sync_marker",
            WriteStep::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// A record's write sequence failed; nothing from it was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {source}")]
pub struct TransactionError {
    pub step: WriteStep,
    #[source]
    pub source: StoreError,
}

impl TransactionError {
    fn at(step: WriteStep) -> impl FnOnce(StoreError) -> Self {
        move |source| Self { step, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverWrite {
    Updated,
    Inserted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub resolution: Resolution,
    pub driver_id: i64,
    pub driver_write: DriverWrite,
    /// Vehicle-side tables where the update matched no row.
    pub unmatched_tables: Vec<&'static str>,
}

/// Runs resolution and every write of one record inside `uow` without
/// committing. The caller commits or rolls back based on the result.
/// An ambiguous resolution is reported before any write, so it is visible
/// even when the line later fails.
pub async fn apply_record<U>(
    uow: &mut U,
    tenant_id: i64,
    record: &ExtractRecord,
    observer: &dyn SyncObserver,
) -> Result<ReconcileOutcome, TransactionError>
where
    U: UnitOfWork + ?Sized,
{
    let profile = &record.driver;
    let resolution = resolve_driver(uow, &profile.name, profile.national_id.as_ref())
        .await
        .map_err(TransactionError::at(WriteStep::Resolve))?;
    if let Resolution::Ambiguous { candidates } = &resolution {
        observer.ambiguous_match(record, candidates);
    }

    let (driver_id, driver_write) = match resolution.existing_driver() {
        Some(driver_id) => {
            let rows = uow
                .update_driver(driver_id, tenant_id, profile)
                .await
                .map_err(TransactionError::at(WriteStep::UpdateDriver))?;
            if rows == 0 {
                return Err(TransactionError {
                    step: WriteStep::UpdateDriver,
                    source: StoreError::RowMissing {
                        table: DRIVER_TABLE,
                        key: driver_id,
                    },
                });
            }
            debug!(driver_id, name = %profile.name, "driver updated");
            (driver_id, DriverWrite::Updated)
        }
        None => {
            let driver_id = uow
                .insert_driver(tenant_id, profile)
                .await
                .map_err(TransactionError::at(WriteStep::InsertDriver))?;
            debug!(driver_id, name = %profile.name, "driver inserted");
            (driver_id, DriverWrite::Inserted)
        }
    };

    let mut unmatched_tables = Vec::new();

    let rows = uow
        .assign_vehicle(record.vehicle_id, &record.trailer_plate, &profile.name, driver_id)
        .await
        .map_err(TransactionError::at(WriteStep::AssignVehicle))?;
    if rows == 0 {
        unmatched_tables.push(ASSIGNMENT_TABLE);
    }

    let rows = uow
        .update_vehicle_plate(record.vehicle_id, &record.vehicle_plate)
        .await
        .map_err(TransactionError::at(WriteStep::UpdatePlate))?;
    if rows == 0 {
        unmatched_tables.push(VEHICLE_TABLE);
    }

    let rows = uow
        .touch_sync_marker(record.vehicle_id)
        .await
        .map_err(TransactionError::at(WriteStep::TouchSyncMarker))?;
    if rows == 0 {
        unmatched_tables.push(SYNC_MARKER_TABLE);
    }

    Ok(ReconcileOutcome {
        resolution,
        driver_id,
        driver_write,
        unmatched_tables,
    })
}

/// Opens a transaction, applies the record and commits it, rolling back on
/// any failure.
pub async fn reconcile_record(
    store: &dyn ReconcileStore,
    tenant_id: i64,
    record: &ExtractRecord,
    observer: &dyn SyncObserver,
) -> Result<ReconcileOutcome, TransactionError> {
    let mut uow = store
        .begin()
        .await
        .map_err(TransactionError::at(WriteStep::Begin))?;

    match apply_record(&mut *uow, tenant_id, record, observer).await {
        Ok(outcome) => {
            uow.commit()
                .await
                .map_err(TransactionError::at(WriteStep::Commit))?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(line = record.line_number, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::observer::NoopObserver;
    use crate::resolver::MatchTier;
    use fleetsync_core::{DriverProfile, NationalId};

    fn record(vehicle_id: i64, name: &str, national_id: Option<&str>) -> ExtractRecord {
        ExtractRecord {
            line_number: 1,
            vehicle_id,
            vehicle_plate: "NEW1234".into(),
            trailer_plate: "TRL0001".into(),
            driver_ref: None,
            driver: DriverProfile {
                name: name.into(),
                phone: Some("11 5555-0000".into()),
                national_id: national_id.and_then(NationalId::normalize),
                ..DriverProfile::default()
            },
        }
    }

    #[tokio::test]
    async fn existing_driver_is_overwritten_and_vehicle_rows_updated() {
        let store = MemoryStore::new();
        let driver_id = store.seed_driver(DriverProfile {
            name: "OLD NAME".into(),
            national_id: NationalId::normalize("12345678901"),
            ..DriverProfile::default()
        });
        store.seed_vehicle(10, "OLD0000");

        let record = record(10, "New Name", Some("12345678901"));
        let outcome = reconcile_record(&store, 269, &record, &NoopObserver)
            .await
            .expect("reconciled");
        assert_eq!(outcome.driver_id, driver_id);
        assert_eq!(outcome.driver_write, DriverWrite::Updated);
        assert_eq!(
            outcome.resolution,
            Resolution::Found {
                driver_id,
                tier: MatchTier::NationalId
            }
        );
        assert!(outcome.unmatched_tables.is_empty());

        let state = store.snapshot();
        let stored = &state.drivers[&driver_id];
        assert_eq!(stored.tenant_id, 269);
        assert_eq!(stored.profile.name, "New Name");
        assert_eq!(stored.profile.phone.as_deref(), Some("11 5555-0000"));
        assert_eq!(state.grid[&10].driver_id, Some(driver_id));
        assert_eq!(state.grid[&10].trailer_plate, "TRL0001");
        assert_eq!(state.vehicle_plates[&10], "NEW1234");
        assert_eq!(state.sync_markers[&10], 1);
    }

    #[tokio::test]
    async fn unknown_vehicle_is_reported_not_failed() {
        let store = MemoryStore::new();
        let outcome = reconcile_record(&store, 269, &record(77, "Someone", None), &NoopObserver)
            .await
            .expect("reconciled");
        assert_eq!(outcome.driver_write, DriverWrite::Inserted);
        assert_eq!(
            outcome.unmatched_tables,
            vec![ASSIGNMENT_TABLE, VEHICLE_TABLE, SYNC_MARKER_TABLE]
        );
        assert_eq!(store.snapshot().drivers.len(), 1);
    }

    #[tokio::test]
    async fn failure_after_insert_leaves_no_orphan_driver() {
        let store = MemoryStore::new();
        store.seed_vehicle(10, "OLD0000");
        store.fail_on(WriteStep::AssignVehicle);

        let err = reconcile_record(&store, 269, &record(10, "Brand New", None), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.step, WriteStep::AssignVehicle);

        let state = store.snapshot();
        assert!(state.drivers.is_empty());
        assert_eq!(state.sync_markers[&10], 0);
    }

    #[tokio::test]
    async fn commit_failure_discards_all_writes() {
        let store = MemoryStore::new();
        store.seed_vehicle(10, "OLD0000");
        store.fail_on(WriteStep::Commit);

        let err = reconcile_record(&store, 269, &record(10, "Brand New", None), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.step, WriteStep::Commit);
        assert_eq!(store.snapshot().vehicle_plates[&10], "OLD0000");
    }

    #[test]
    fn error_message_names_the_step() {
        let err = TransactionError {
            step: WriteStep::TouchSyncMarker,
            source: StoreError::Query("boom".into()),
        };
        assert_eq!(err.to_string(), "touch_sync_marker failed: query failed: boom");
    }
}
