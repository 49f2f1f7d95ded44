//! Runtime configuration, built once at startup and passed down.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetsync_core::{DEFAULT_TENANT_ID, DELIMITER, MIN_COLUMNS};
use fleetsync_extract::ExtractLayout;
use sqlx::postgres::PgConnectOptions;

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub enum DatabaseTarget {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
    },
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(_) => f.write_str("Url(<redacted>)"),
            Self::Parts {
                host,
                port,
                database,
                username,
                ..
            } => f
                .debug_struct("Parts")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub target: DatabaseTarget,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        match &self.target {
            DatabaseTarget::Url(url) => {
                PgConnectOptions::from_str(url).context("parsing DATABASE_URL")
            }
            DatabaseTarget::Parts {
                host,
                port,
                database,
                username,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(username)
                .password(password)),
        }
    }
}

/// Settings the reconciliation core needs for every line.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub tenant_id: i64,
    pub layout: ExtractLayout,
    /// Vehicles whose appearance is reported at warning level.
    pub watch_vehicles: BTreeSet<i64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_TENANT_ID,
            layout: ExtractLayout::default(),
            watch_vehicles: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub reconcile: ReconcileConfig,
    pub reports_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
}

impl SyncConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        let target = match std::env::var("DATABASE_URL") {
            Ok(url) => DatabaseTarget::Url(url),
            Err(_) => DatabaseTarget::Parts {
                host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: parse_var("DB_PORT")?.unwrap_or(DEFAULT_DB_PORT),
                database: std::env::var("DB_NAME").context("DB_NAME or DATABASE_URL must be set")?,
                username: std::env::var("DB_USER").context("DB_USER or DATABASE_URL must be set")?,
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            },
        };

        let delimiter = match std::env::var("FLEETSYNC_DELIMITER") {
            Ok(value) => single_char(&value)?,
            Err(_) => DELIMITER,
        };

        Ok(Self {
            database: DatabaseConfig {
                target,
                connect_timeout: Duration::from_secs(
                    parse_var("FLEETSYNC_DB_CONNECT_TIMEOUT_SECS")?
                        .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
                ),
            },
            reconcile: ReconcileConfig {
                tenant_id: parse_var("FLEETSYNC_TENANT_ID")?.unwrap_or(DEFAULT_TENANT_ID),
                layout: ExtractLayout {
                    delimiter,
                    min_columns: parse_var("FLEETSYNC_MIN_COLUMNS")?.unwrap_or(MIN_COLUMNS),
                },
                watch_vehicles: parse_id_list(
                    &std::env::var("FLEETSYNC_WATCH_VEHICLES").unwrap_or_default(),
                )?,
            },
            reports_dir: std::env::var("FLEETSYNC_REPORTS_DIR").ok().map(PathBuf::from),
            staging_dir: std::env::var("FLEETSYNC_STAGING_DIR").ok().map(PathBuf::from),
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

fn single_char(value: &str) -> Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => anyhow::bail!("FLEETSYNC_DELIMITER must be a single character, got {value:?}"),
    }
}

pub(crate) fn parse_id_list(raw: &str) -> Result<BTreeSet<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("invalid vehicle id in FLEETSYNC_WATCH_VEHICLES: {s:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_list_parses_and_ignores_blanks() {
        let ids = parse_id_list(" 51773, ,60001,").expect("valid list");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![51773, 60001]);
        assert!(parse_id_list("").expect("empty").is_empty());
        assert!(parse_id_list("12,abc").is_err());
    }

    #[test]
    fn delimiter_must_be_one_character() {
        assert_eq!(single_char(";").expect("valid"), ';');
        assert!(single_char("").is_err());
        assert!(single_char(";;").is_err());
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let target = DatabaseTarget::Url("postgres://u:hunter2@db/fleet".into());
        assert!(!format!("{target:?}").contains("hunter2"));

        let parts = DatabaseTarget::Parts {
            host: "db".into(),
            port: 5432,
            database: "fleet".into(),
            username: "u".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{parts:?}").contains("hunter2"));
    }

    #[test]
    fn reconcile_defaults_match_extract_layout() {
        let config = ReconcileConfig::default();
        assert_eq!(config.tenant_id, 269);
        assert_eq!(config.layout.min_columns, 17);
        assert_eq!(config.layout.delimiter, ';');
    }
}
