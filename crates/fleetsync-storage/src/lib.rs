//! File-source collaborators for the extract: where the latest file comes
//! from, and where its bytes are staged while a batch runs.

pub mod ftp;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub use ftp::{FtpConfig, FtpExtractSource};

pub const CRATE_NAME: &str = "fleetsync-storage";

/// Directory name used under the candidate staging roots.
pub const STAGING_DIR_NAME: &str = "ftp_hps";

/// How the returned file was chosen among the available ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBasis {
    /// Newest modification time.
    ModifiedTime,
    /// Modification times were unavailable; the last listed entry was taken.
    /// Not guaranteed to be the newest file.
    ListingOrder,
    /// The caller named the file explicitly.
    Explicit,
}

#[derive(Debug, Clone)]
pub struct FetchedExtract {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
    pub selection: SelectionBasis,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no files found in {location}")]
    NoFiles { location: String },
    #[error("ftp error: {0}")]
    Ftp(#[from] suppaftp::FtpError),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ftp worker task failed: {0}")]
    Task(String),
}

impl FetchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Supplies the byte content of the most recent extract.
#[async_trait]
pub trait ExtractSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_latest(&self) -> Result<FetchedExtract, FetchError>;
}

/// Picks the newest entry by modification time. When any entry lacks a
/// time, falls back to the last entry in listing order.
pub fn pick_latest(
    entries: Vec<(String, Option<DateTime<Utc>>)>,
) -> Option<(String, Option<DateTime<Utc>>, SelectionBasis)> {
    if entries.iter().all(|(_, modified)| modified.is_some()) {
        // max_by_key keeps the last of equal maxima, matching listing order on ties.
        return entries
            .into_iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(name, modified)| (name, modified, SelectionBasis::ModifiedTime));
    }
    entries
        .into_iter()
        .last()
        .map(|(name, modified)| (name, modified, SelectionBasis::ListingOrder))
}

/// A single, explicitly named extract on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExtractSource for LocalFileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch_latest(&self) -> Result<FetchedExtract, FetchError> {
        let bytes = fs::read(&self.path)
            .await
            .map_err(|err| FetchError::io(&self.path, err))?;
        let modified = fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(FetchedExtract {
            file_name: file_name_of(&self.path),
            bytes,
            modified,
            selection: SelectionBasis::Explicit,
        })
    }
}

/// The newest regular file of a local drop directory.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    dir: PathBuf,
}

impl LocalDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ExtractSource for LocalDirSource {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    async fn fetch_latest(&self) -> Result<FetchedExtract, FetchError> {
        let mut reader = fs::read_dir(&self.dir)
            .await
            .map_err(|err| FetchError::io(&self.dir, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| FetchError::io(&self.dir, err))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().ok().map(DateTime::<Utc>::from);
            entries.push((entry.file_name().to_string_lossy().to_string(), modified));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let (name, modified, selection) = pick_latest(entries).ok_or_else(|| FetchError::NoFiles {
            location: self.dir.display().to_string(),
        })?;
        if selection == SelectionBasis::ListingOrder {
            warn!(file = %name, "modification times unavailable, using last file by name");
        }

        let path = self.dir.join(&name);
        let bytes = fs::read(&path).await.map_err(|err| FetchError::io(&path, err))?;
        Ok(FetchedExtract {
            file_name: name,
            bytes,
            modified,
            selection,
        })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Removes characters that are not allowed in file names on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedExtract {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Local directory where fetched extracts are kept while a batch runs.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default candidates in preference order: the user's downloads folder,
    /// the system temp directory, then the current directory.
    pub fn default_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(downloads) = dirs::download_dir() {
            candidates.push(downloads.join(STAGING_DIR_NAME));
        } else if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("Downloads").join(STAGING_DIR_NAME));
        }
        candidates.push(std::env::temp_dir().join(STAGING_DIR_NAME));
        candidates.push(PathBuf::from("."));
        candidates
    }

    /// First candidate that can be created and written to.
    pub async fn select(candidates: &[PathBuf]) -> anyhow::Result<Self> {
        for dir in candidates {
            match probe_writable(dir).await {
                Ok(()) => {
                    info!(dir = %dir.display(), "using staging directory");
                    return Ok(Self::new(dir.clone()));
                }
                Err(err) => warn!(dir = %dir.display(), error = %err, "staging directory not usable"),
            }
        }
        anyhow::bail!("no writable staging directory among {} candidates", candidates.len())
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes the extract under its sanitized name using a temp file and an
    /// atomic rename. A leftover file of the same name is replaced; when it
    /// cannot be removed, a timestamp-prefixed name is used instead.
    pub async fn stage(&self, extract: &FetchedExtract) -> anyhow::Result<StagedExtract> {
        let mut name = sanitize_file_name(&extract.file_name);
        if name.is_empty() {
            name = "extract.txt".to_string();
        }
        let mut target = self.root.join(&name);

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking staged path {}", target.display()))?
        {
            match fs::remove_file(&target).await {
                Ok(()) => info!(path = %target.display(), "removed previous staged extract"),
                Err(err) => {
                    let fallback = format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), name);
                    warn!(path = %target.display(), error = %err, fallback = %fallback, "cannot replace staged extract");
                    target = self.root.join(fallback);
                }
            }
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), extract.bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp staging file {}", temp_path.display()))?;
        let written = async {
            file.write_all(&extract.bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp staging file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming staged extract {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            });
        }

        Ok(StagedExtract {
            path: target,
            sha256: Self::sha256_hex(&extract.bytes),
            byte_size: extract.bytes.len(),
        })
    }

    /// Completion signal from the batch: a successful run removes the staged
    /// file, a failed one keeps it for inspection.
    pub async fn finish(&self, staged: &StagedExtract, succeeded: bool) {
        if !succeeded {
            warn!(path = %staged.path.display(), "batch failed, keeping staged extract");
            return;
        }
        match fs::remove_file(&staged.path).await {
            Ok(()) => info!(path = %staged.path.display(), "removed staged extract"),
            Err(err) => warn!(path = %staged.path.display(), error = %err, "could not remove staged extract"),
        }
    }
}

async fn probe_writable(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let probe = dir.join(format!(".probe-{}", Uuid::new_v4()));
    fs::write(&probe, b"")
        .await
        .with_context(|| format!("writing probe file in {}", dir.display()))?;
    let _ = fs::remove_file(&probe).await;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
