use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::write_json;
use crate::domain::SiteSeries;

/// Schema version of the snapshot file
pub const SNAPSHOT_VERSION: u32 = 4;

pub const SNAPSHOT_FILE: &str = "solcast.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub siteinfo: BTreeMap<String, SiteSeries>,
    pub last_updated: DateTime<Utc>,
    /// Start of the most recent update cycle, successful or not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(siteinfo: BTreeMap<String, SiteSeries>, last_updated: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            siteinfo,
            last_updated,
            last_attempt: None,
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(BTreeMap::new(), DateTime::<Utc>::default())
    }
}

/// Result of reading the snapshot file. Loading never fails hard.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded(Snapshot),
    Missing,
    Corrupt(String),
    /// Written by a different schema version; the file is left alone
    Incompatible { found: u64 },
}

/// Owner of the snapshot file
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    /// Set once data has been loaded or fetched; saves are skipped until then
    ready: AtomicBool,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SNAPSHOT_FILE),
            ready: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub async fn load(&self) -> LoadStatus {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot found");
                return LoadStatus::Missing;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unreadable");
                return LoadStatus::Corrupt(e.to_string());
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot is not valid JSON");
                return LoadStatus::Corrupt(e.to_string());
            }
        };

        // Files from before versioning carry no version field
        let found = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
        if found != u64::from(SNAPSHOT_VERSION) {
            warn!(found, expected = SNAPSHOT_VERSION, "snapshot schema version is incompatible");
            return LoadStatus::Incompatible { found };
        }

        match serde_json::from_value::<Snapshot>(value) {
            Ok(snapshot) => {
                info!(
                    sites = snapshot.siteinfo.len(),
                    last_updated = %snapshot.last_updated,
                    "snapshot loaded"
                );
                self.mark_ready();
                LoadStatus::Loaded(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "snapshot does not match the expected shape");
                LoadStatus::Corrupt(e.to_string())
            }
        }
    }

    /// Write the snapshot atomically. Returns `false` when skipped because no
    /// data has been loaded or fetched yet.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<bool, SnapshotError> {
        if !self.is_ready() {
            debug!("no data loaded yet, not writing snapshot");
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        write_json(&self.path, snapshot).await?;
        debug!(path = %self.path.display(), sites = snapshot.siteinfo.len(), "snapshot saved");
        Ok(true)
    }

    /// Remove the file and require a fresh load or fetch before saving again
    pub async fn delete(&self) -> Result<(), SnapshotError> {
        let _guard = self.write_lock.lock().await;
        self.ready.store(false, Ordering::Release);
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
