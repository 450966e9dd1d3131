//! Durable storage for the committed manifest and the check history
//!
//! The committed manifest is only ever replaced by renaming a fully written
//! sibling file over it, so readers see either the old or the new document.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, UpdateError};
use crate::manifest::{CompatibilityFilter, Manifest};

/// Suffix of in-flight manifest downloads
const TEMP_SUFFIX: &str = ".tmp";

/// Last-known-good manifest on disk
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the committed manifest
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "manifest".to_string())
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// A fresh download target next to the committed file.
    ///
    /// Every call returns a new name so concurrent attempts never share a file,
    /// and the same directory keeps the final rename atomic.
    pub fn temp_path(&self) -> PathBuf {
        self.dir().join(format!(
            "{}.{}{}",
            self.file_name(),
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ))
    }

    /// Create the directory holding the manifest
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(self.dir()).await?;
        Ok(())
    }

    /// Parse a manifest file
    pub async fn read_manifest(path: &Path) -> Result<Manifest> {
        let bytes = fs::read(path).await?;
        Manifest::parse(&bytes)
    }

    /// Load the committed manifest, if one exists
    pub async fn load(&self) -> Result<Option<Manifest>> {
        if !self.exists() {
            return Ok(None);
        }
        Self::read_manifest(&self.path).await.map(Some)
    }

    /// Atomically replace the committed manifest with `temp`.
    ///
    /// On failure the temp file is removed and the committed manifest is left
    /// exactly as it was.
    pub async fn commit(&self, temp: &Path) -> Result<()> {
        let result = self.commit_inner(temp).await;
        if result.is_err() {
            Self::discard(temp).await;
        }
        result
    }

    async fn commit_inner(&self, temp: &Path) -> Result<()> {
        let file = fs::File::open(temp)
            .await
            .map_err(|e| UpdateError::commit(format!("{}: {}", temp.display(), e)))?;
        file.sync_all().await?;
        drop(file);

        fs::rename(temp, &self.path).await.map_err(|e| {
            UpdateError::commit(format!(
                "rename {} -> {}: {}",
                temp.display(),
                self.path.display(),
                e
            ))
        })?;

        // Persist the rename itself; not every platform can open a directory.
        if let Ok(dir) = fs::File::open(self.dir()).await {
            if let Err(e) = dir.sync_all().await {
                debug!("Directory sync skipped: {}", e);
            }
        }

        info!("Committed manifest {}", self.path.display());
        Ok(())
    }

    /// Remove a temp file, ignoring errors
    pub async fn discard(temp: &Path) {
        match fs::remove_file(temp).await {
            Ok(()) => debug!("Removed {}", temp.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", temp.display(), e),
        }
    }

    /// Whether `candidate` offers a compatible id the committed manifest does not.
    ///
    /// Without a committed manifest there is nothing to compare and the
    /// answer is `false`. An unreadable committed manifest counts as changed.
    pub async fn introduces_new_ids(
        &self,
        candidate: &Manifest,
        filter: &CompatibilityFilter,
    ) -> Result<bool> {
        let previous = match self.load().await {
            Ok(Some(previous)) => previous.compatible(filter),
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!("Committed manifest unreadable, treating as changed: {}", e);
                return Ok(true);
            }
        };

        let known = previous.ids();
        let changed = candidate
            .compatible(filter)
            .ids()
            .iter()
            .any(|id| !known.contains(id));
        Ok(changed)
    }

    /// SHA-256 of the committed manifest, hex encoded
    pub async fn digest(&self) -> Result<Option<String>> {
        if !self.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).await?;
        Ok(Some(hex::encode(Sha256::digest(&bytes))))
    }

    /// Delete temp files left behind by interrupted fetches
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let dir = self.dir();
        if !dir.is_dir() {
            return Ok(0);
        }

        let prefix = format!("{}.", self.file_name());
        let mut removed = 0;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX) {
                Self::discard(&entry.path()).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} orphaned manifest downloads", removed);
        }
        Ok(removed)
    }
}

/// Persisted record of successful checks
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckHistory {
    /// Time of the last successful check
    pub last_check: Option<DateTime<Utc>>,
}

impl CheckHistory {
    /// Load history, falling back to an empty one if the file is missing
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save atomically (write to temp, then rename)
    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }
}

/// Serialize `value` to `path` through a sibling temp file and a rename
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&temp_path, content).await?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        ManifestStore::discard(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
