//! PostgreSQL implementation of the store seam.

use async_trait::async_trait;
use fleetsync_core::{DriverCandidate, DriverProfile, NationalId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::store::{DriverLookup, ReconcileStore, StoreError, UnitOfWork};

const SELECT_BY_NATIONAL_ID: &str = r#"
    SELECT mot_id::bigint AS mot_id, mot_nom
    FROM motorista
    WHERE mot_cpf = $1
    ORDER BY mot_id
"#;

const SELECT_BY_EXACT_NAME: &str = r#"
    SELECT mot_id::bigint AS mot_id, mot_nom
    FROM motorista
    WHERE UPPER(mot_nom) = $1
    ORDER BY mot_id
"#;

// A substring pattern also covers the prefix case.
const SELECT_BY_NAME_FRAGMENT: &str = r#"
    SELECT mot_id::bigint AS mot_id, mot_nom
    FROM motorista
    WHERE UPPER(mot_nom) LIKE $1 ESCAPE '\'
    ORDER BY mot_id
"#;

const UPDATE_DRIVER: &str = r#"
    UPDATE motorista
    SET cli_id = $1, mot_nom = $2, mot_tel = $3, mot_cnh = $4, mot_cpf = $5,
        mot_rua = $6, mot_num = $7, mot_bai = $8, mot_cid = $9, mot_uf = $10
    WHERE mot_id = $11
"#;

const INSERT_DRIVER: &str = r#"
    INSERT INTO motorista (cli_id, mot_nom, mot_tel, mot_cnh, mot_cpf, mot_rua, mot_num, mot_bai, mot_cid, mot_uf, mot_mat)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL)
    RETURNING mot_id::bigint AS mot_id
"#;

const UPDATE_ASSIGNMENT: &str = r#"
    UPDATE grid_ext
    SET placa_car = $1, mot_nom = $2, mot_id = $3
    WHERE vei_id = $4
"#;

const UPDATE_VEHICLE_PLATE: &str = r#"
    UPDATE cad_veiculo
    SET vei_plc = $1
    WHERE vei_id = $2
"#;

const TOUCH_SYNC_MARKER: &str = r#"
    UPDATE last_datastore
    SET vei_id = $1
    WHERE vei_id = $1
"#;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Escapes `LIKE` metacharacters so names are matched literally.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Single-connection pool held open for the whole batch.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = config
            .connect_options()
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        info!("database connection established");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database connection closed");
    }
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn candidate_from_row(row: &PgRow) -> Result<DriverCandidate, StoreError> {
    Ok(DriverCandidate {
        driver_id: row.try_get("mot_id")?,
        name: row
            .try_get::<Option<String>, _>("mot_nom")?
            .unwrap_or_default(),
    })
}

impl PgUnitOfWork {
    async fn candidates(&mut self, sql: &str, param: &str) -> Result<Vec<DriverCandidate>, StoreError> {
        let rows = sqlx::query(sql).bind(param).fetch_all(&mut *self.tx).await?;
        rows.iter().map(candidate_from_row).collect()
    }
}

#[async_trait]
impl DriverLookup for PgUnitOfWork {
    async fn drivers_by_national_id(
        &mut self,
        national_id: &NationalId,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        self.candidates(SELECT_BY_NATIONAL_ID, national_id.as_str()).await
    }

    async fn drivers_by_exact_name(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        self.candidates(SELECT_BY_EXACT_NAME, upper_name).await
    }

    async fn drivers_by_name_fragment(
        &mut self,
        upper_name: &str,
    ) -> Result<Vec<DriverCandidate>, StoreError> {
        let pattern = format!("%{}%", escape_like(upper_name));
        self.candidates(SELECT_BY_NAME_FRAGMENT, &pattern).await
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn update_driver(
        &mut self,
        driver_id: i64,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(UPDATE_DRIVER)
            .bind(tenant_id)
            .bind(&profile.name)
            .bind(&profile.phone)
            .bind(&profile.license)
            .bind(profile.national_id.as_ref().map(NationalId::as_str))
            .bind(&profile.street)
            .bind(&profile.house_number)
            .bind(&profile.neighborhood)
            .bind(&profile.city)
            .bind(&profile.state)
            .bind(driver_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_driver(
        &mut self,
        tenant_id: i64,
        profile: &DriverProfile,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(INSERT_DRIVER)
            .bind(tenant_id)
            .bind(&profile.name)
            .bind(&profile.phone)
            .bind(&profile.license)
            .bind(profile.national_id.as_ref().map(NationalId::as_str))
            .bind(&profile.street)
            .bind(&profile.house_number)
            .bind(&profile.neighborhood)
            .bind(&profile.city)
            .bind(&profile.state)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.try_get("mot_id")?)
    }

    async fn assign_vehicle(
        &mut self,
        vehicle_id: i64,
        trailer_plate: &str,
        driver_name: &str,
        driver_id: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(UPDATE_ASSIGNMENT)
            .bind(trailer_plate)
            .bind(driver_name)
            .bind(driver_id)
            .bind(vehicle_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_vehicle_plate(&mut self, vehicle_id: i64, plate: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(UPDATE_VEHICLE_PLATE)
            .bind(plate)
            .bind(vehicle_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn touch_sync_marker(&mut self, vehicle_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(TOUCH_SYNC_MARKER)
            .bind(vehicle_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("JOAO"), "JOAO");
        assert_eq!(escape_like("50%_OFF"), "50\\%\\_OFF");
        assert_eq!(escape_like("A\\B"), "A\\\\B");
    }

    #[test]
    fn connection_errors_are_fatal_and_query_errors_are_not() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_connection_loss());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StoreError::from(sqlx::Error::Io(io)).is_connection_loss());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_connection_loss());
    }
}
