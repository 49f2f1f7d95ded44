//! In-memory store with the same transactional contract as the PostgreSQL
//! store. Used by tests; supports injected failures.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleetsync_core::{DriverCandidate, DriverProfile, NationalId};

use crate::reconcile::WriteStep;
use crate::store::{DriverLookup, ReconcileStore, StoreError, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDriver {
    pub tenant_id: i64,
    pub profile: DriverProfile,
    /// External registration; never written by the reconciliation.
    pub registration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridRow {
    pub trailer_plate: String,
    pub driver_name: String,
    pub driver_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub drivers: BTreeMap<i64, StoredDriver>,
    pub grid: BTreeMap<i64, GridRow>,
    pub vehicle_plates: BTreeMap<i64, String>,
    /// Vehicle id to number of times its watermark row was touched.
    pub sync_markers: BTreeMap<i64, u32>,
    next_driver_id: i64,
}

impl MemoryState {
    fn allocate_driver_id(&mut self) -> i64 {
        self.next_driver_id += 1;
        self.next_driver_id
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_step: Option<WriteStep>,
    disconnect_after_commits: Option<usize>,
    commits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a committed driver row and returns its id.
    pub fn seed_driver(&self, profile: DriverProfile) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.allocate_driver_id();
        state.drivers.insert(
            id,
            StoredDriver {
                tenant_id: 0,
                profile,
                registration: None,
            },
        );
        id
    }

    /// Registers a pre-existing vehicle in all three vehicle tables.
    pub fn seed_vehicle(&self, vehicle_id: i64, plate: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.grid.insert(vehicle_id, GridRow::default());
        state.vehicle_plates.insert(vehicle_id, plate.to_string());
        state.sync_markers.insert(vehicle_id, 0);
    }

    /// Makes every execution of `step` fail with a query error.
    pub fn fail_on(&self, step: WriteStep) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.fail_step = Some(step);
    }

    /// Simulates the connection dropping after `commits` successful commits.
    pub fn disconnect_after(&self, commits: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.disconnect_after_commits = Some(commits);
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        {
            let faults = lock(&self.faults)?;
            if let Some(limit) = faults.disconnect_after_commits {
                if faults.commits >= limit {
                    return Err(StoreError::Unavailable("connection reset by peer".to_string()));
                }
            }
        }
        let working = lock(&self.state)?.clone();
        Ok(Box::new(MemoryUnitOfWork {
            working,
            shared: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct MemoryUnitOfWork {
    working: MemoryState,
    shared: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryUnitOfWork {
    fn check(&self, step: WriteStep) -> Result<(), StoreError> {
        if lock(&self.faults)?.fail_step == Some(step) {
            return Err(StoreError::Query(format!("injected failure at {step}")));
        }
        Ok(())
    }

    fn candidates<F>(&self, keep: F) -> Vec<DriverCandidate>
    where
        F: Fn(&StoredDriver) -> bool,
    {
        self.working
            .drivers
            .iter()
            .filter(|(_, d)| keep(d))
            .map(|(id, d)| DriverCandidate {
                driver_id: *id,
                name: d.profile.name.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl DriverLookup for MemoryUnitOfWork {
    async fn drivers_by_national_id(
        &mut self,
        national_id: &NationalId,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        Ok(self.candidates(|d| d.profile.national_id.as_ref() == Some(national_id)))
    }

    async fn drivers_by_exact_name(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        Ok(self.candidates(|d| d.profile.name.to_uppercase() == upper_name))
    }

    async fn drivers_by_name_fragment(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        Ok(self.candidates(|d| d.profile.name.to_uppercase().contains(upper_name)))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn update_driver(
        &mut self,
        driver_id: i64,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<u64, StoreError> {
        self.check(WriteStep::UpdateDriver)?;
        match self.working.drivers.get_mut(&driver_id) {
            Some(row) => {
                row.tenant_id = tenant_id;
                row.profile = profile.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_driver(
        &mut self,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<i64, StoreError> {
        self.check(WriteStep::InsertDriver)?;
        let id = self.working.allocate_driver_id();
        self.working.drivers.insert(
            id,
            StoredDriver {
                tenant_id,
                profile: profile.clone(),
                registration: None,
            },
        );
        Ok(id)
    }

    async fn assign_vehicle(
        &mut self,
        vehicle_id: i64,
        trailer_plate: &str,
        driver_name: &str,
        driver_id: i64,
    ) -> Result<u64, StoreError> {
        self.check(WriteStep::AssignVehicle)?;
        match self.working.grid.get_mut(&vehicle_id) {
            Some(row) => {
                row.trailer_plate = trailer_plate.to_string();
                row.driver_name = driver_name.to_string();
                row.driver_id = Some(driver_id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_vehicle_plate(&mut self, vehicle_id: i64, plate: &str) -> Result<u64, StoreError> {
        self.check(WriteStep::UpdatePlate)?;
        match self.working.vehicle_plates.get_mut(&vehicle_id) {
            Some(current) => {
                *current = plate.to_string();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn touch_sync_marker(&mut self, vehicle_id: i64) -> Result<u64, StoreError> {
        self.check(WriteStep::TouchSyncMarker)?;
        match self.working.sync_markers.get_mut(&vehicle_id) {
            Some(touches) => {
                *touches += 1;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check(WriteStep::Commit)?;
        let this = *self;
        *lock(&this.shared)? = this.working;
        lock(&this.faults)?.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
