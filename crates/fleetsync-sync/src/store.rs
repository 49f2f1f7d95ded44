//! Store seam between the reconciliation core and the relational database.

use async_trait::async_trait;
use fleetsync_core::{DriverCandidate, DriverProfile, NationalId};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum StoreError {
    /// The connection could not be established or was severed. Fatal for the batch.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("no {table} row for key {key}")]
    RowMissing { table: &'static str, key: i64 },
}

impl StoreError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Read side used by the identity resolver. Names passed in are already
/// trimmed and uppercased.
#[async_trait]
pub trait DriverLookup: Send {
    async fn drivers_by_national_id(
        &mut self,
        national_id: &NationalId,
    ) -> Result<Vec<DriverCandidate>, StoreError>;

    async fn drivers_by_exact_name(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError>;

    /// Drivers whose uppercased name starts with or contains `upper_name`.
    async fn drivers_by_name_fragment(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError>;
}

/// One open transaction. Writes become visible only after [`UnitOfWork::commit`];
/// dropping or rolling back discards them.
#[async_trait]
pub trait UnitOfWork: DriverLookup {
    async fn update_driver(
        &mut self,
        driver_id: i64,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<u64, StoreError>;

    /// Inserts a driver with the external registration left empty and returns its id.
    async fn insert_driver(
        &mut self,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<i64, StoreError>;

    /// Sets trailer, denormalized driver name and driver id on `grid_ext`.
    async fn assign_vehicle(
        &mut self,
        vehicle_id: i64,
        trailer_plate: &str,
        driver_name: &str,
        driver_id: i64,
    ) -> Result<u64, StoreError>;

    /// Sets the plate on `cad_veiculo`.
    async fn update_vehicle_plate(&mut self, vehicle_id: i64, plate: &str) -> Result<u64, StoreError>;

    /// Touches the `last_datastore` watermark row.
    async fn touch_sync_marker(&mut self, vehicle_id: i64) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}
