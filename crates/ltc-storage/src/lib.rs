//! Durable file storage for LTC collection runs: raw page artifacts,
//! checkpoints, per-source outputs and the serving cache.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use ltc_core::{CacheSnapshot, CollectionProgress, FacilityRecord};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

mod http;
mod rate;

pub use http::{
    is_transient_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
};
pub use rate::{
    Clock, FixedIntervalLimiter, ManualClock, RateLimiter, SimpleTokenBucket, TokioClock,
    Unlimited,
};

pub const CRATE_NAME: &str = "ltc-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// What [`write_atomic`] does when the destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    KeepExisting,
}

/// Write `bytes` through a temp file in the destination directory, then
/// rename into place. Readers see the old file or the new one, never a mix.
///
/// Returns `false` when [`WriteMode::KeepExisting`] found the file present.
pub async fn write_atomic(path: &Path, bytes: &[u8], mode: WriteMode) -> anyhow::Result<bool> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let keep = mode == WriteMode::KeepExisting;
    if keep && fs::try_exists(path).await.unwrap_or(false) {
        return Ok(false);
    }

    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    if let Err(err) = write_temp(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            if keep && err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(false);
            }
            Err(err).with_context(|| format!("moving {} into place", path.display()))
        }
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("creating {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes, WriteMode::Replace).await?;
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Where a raw page landed in the artifact store.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub bytes: usize,
    /// The same content was already stored for this source and day.
    pub reused: bool,
}

/// Raw pages keyed by content: `<source>/<YYYYMMDD>/<sha256>.<ext>`. Files are
/// written once and never modified.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        body: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let sha256 = sha256_hex(body);
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let relative_path = Path::new(source_id)
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{sha256}.{ext}"));
        let absolute_path = self.root.join(&relative_path);
        let written = write_atomic(&absolute_path, body, WriteMode::KeepExisting).await?;
        Ok(StoredArtifact {
            sha256,
            relative_path,
            absolute_path,
            bytes: body.len(),
            reused: !written,
        })
    }
}

/// Checkpoint and final output files of each source, kept side by side under
/// one data directory: `<source>.progress.json` and `<source>.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn progress_path(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{source_id}.progress.json"))
    }

    pub fn output_path(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{source_id}.json"))
    }

    /// `Ok(None)` when no checkpoint exists yet. A checkpoint that cannot be
    /// parsed is an error: silently restarting would refetch everything.
    pub async fn load_progress<R: DeserializeOwned>(
        &self,
        source_id: &str,
    ) -> anyhow::Result<Option<CollectionProgress<R>>> {
        let path = self.progress_path(source_id);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        read_json(&path).await.map(Some)
    }

    pub async fn save_progress<R: Serialize>(
        &self,
        source_id: &str,
        progress: &CollectionProgress<R>,
    ) -> anyhow::Result<()> {
        write_json_atomic(&self.progress_path(source_id), progress).await
    }

    pub async fn save_output<R: Serialize>(
        &self,
        source_id: &str,
        output: &CollectionProgress<R>,
    ) -> anyhow::Result<()> {
        write_json_atomic(&self.output_path(source_id), output).await
    }

    pub async fn load_output<R: DeserializeOwned>(
        &self,
        source_id: &str,
    ) -> anyhow::Result<CollectionProgress<R>> {
        let path = self.output_path(source_id);
        read_json(&path)
            .await
            .with_context(|| format!("loading raw output of source {source_id}"))
    }

    pub async fn output_exists(&self, source_id: &str) -> bool {
        fs::try_exists(self.output_path(source_id))
            .await
            .unwrap_or(false)
    }
}

/// Persisted copy of the last dataset handed to the serving layer.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    source: String,
    url: String,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            url: url.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the cache file is absent or unreadable; callers treat both
    /// as "no cache".
    pub async fn load(&self) -> Option<CacheSnapshot> {
        match fs::try_exists(&self.path).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot stat cache file");
                return None;
            }
        }
        match read_json::<CacheSnapshot>(&self.path).await {
            Ok(snapshot) => {
                info!(
                    path = %self.path.display(),
                    entries = snapshot.data.len(),
                    last_updated = %snapshot.last_updated,
                    "loaded cache from file"
                );
                Some(snapshot)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = ?err, "ignoring unreadable cache file");
                None
            }
        }
    }

    /// A snapshot of `data` stamped with the current time.
    pub fn stamp(&self, data: Vec<FacilityRecord>) -> CacheSnapshot {
        let now = Utc::now();
        CacheSnapshot {
            data,
            last_updated: now,
            scraped_at: now,
            source: self.source.clone(),
            url: self.url.clone(),
        }
    }

    pub async fn write(&self, snapshot: &CacheSnapshot) -> anyhow::Result<()> {
        write_json_atomic(&self.path, snapshot).await?;
        info!(path = %self.path.display(), entries = snapshot.data.len(), "cache saved");
        Ok(())
    }

    /// Replace the cache file with `data`, stamped with the current time.
    pub async fn save(&self, data: Vec<FacilityRecord>) -> anyhow::Result<CacheSnapshot> {
        let snapshot = self.stamp(data);
        self.write(&snapshot).await?;
        Ok(snapshot)
    }
}
