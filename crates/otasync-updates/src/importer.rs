//! Import of user supplied update packages
//!
//! The package is copied into the downloads directory under a fixed name and
//! registered as a local update. Only one import exists at a time: a
//! successful import replaces the previous package and its registry entry,
//! a failed one leaves both in place.
//!
//! Imported entries are recorded in a small JSON index so they survive a
//! restart; [`LocalImporter::restore`] puts them back into the registry.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, UpdateError};
use crate::models::{UpdateInfo, UpdateMetadata};
use crate::registry::UpdateRegistry;
use crate::store::write_json_atomic;

/// File name of the most recent import
pub const LOCAL_UPDATE_FILE: &str = "update.zip";

/// Release type recorded for imported packages
pub const LOCAL_UPDATE_TYPE: &str = "local_update";

const PARTIAL_SUFFIX: &str = ".part";

/// Persisted list of imported updates
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIndex {
    pub updates: Vec<UpdateInfo>,
}

impl LocalIndex {
    /// Load the index, falling back to an empty one if the file is missing
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }
}

/// Copies packages into local storage and registers them
#[derive(Clone)]
pub struct LocalImporter {
    registry: UpdateRegistry,
    downloads_dir: PathBuf,
    index_path: PathBuf,
}

impl LocalImporter {
    pub fn new(
        registry: UpdateRegistry,
        downloads_dir: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            downloads_dir: downloads_dir.into(),
            index_path: index_path.into(),
        }
    }

    /// Where the imported package ends up
    pub fn destination(&self) -> PathBuf {
        self.downloads_dir.join(LOCAL_UPDATE_FILE)
    }

    /// Copy `source` into the downloads directory and register it
    pub async fn import<R>(&self, mut source: R) -> Result<UpdateInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        fs::create_dir_all(&self.downloads_dir).await?;
        self.cleanup_partials().await?;

        let destination = self.destination();
        let partial = self.downloads_dir.join(format!(
            "{}.{}{}",
            LOCAL_UPDATE_FILE,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));

        let size = match Self::copy_to(&mut source, &partial).await {
            Ok(size) => size,
            Err(e) => {
                Self::remove_quietly(&partial).await;
                return Err(UpdateError::import(format!("copy failed: {}", e)));
            }
        };

        if let Err(e) = fs::rename(&partial, &destination).await {
            Self::remove_quietly(&partial).await;
            return Err(UpdateError::import(format!(
                "could not move package into place: {}",
                e
            )));
        }

        // The previous package was just overwritten
        self.drop_entries_for(&destination);

        let update = UpdateInfo::local(
            Uuid::new_v4().to_string(),
            Utc::now().timestamp(),
            UpdateMetadata {
                name: LOCAL_UPDATE_FILE.to_string(),
                version: String::new(),
                release_type: LOCAL_UPDATE_TYPE.to_string(),
                size,
                download_url: None,
                checksum: None,
                local_path: Some(destination.clone()),
            },
        );

        self.registry.add(update.clone());
        let index = LocalIndex {
            updates: vec![update.clone()],
        };
        if let Err(e) = index.save(&self.index_path).await {
            warn!("Could not record local update {}: {}", update.id, e);
        }

        info!(
            "Imported local update {} ({} bytes) to {}",
            update.id,
            size,
            destination.display()
        );
        Ok(update)
    }

    /// Import a package from a file on disk
    pub async fn import_file(&self, path: &Path) -> Result<UpdateInfo> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| UpdateError::import(format!("{}: {}", path.display(), e)))?;
        self.import(file).await
    }

    /// Register the recorded imports whose package is still on disk.
    ///
    /// Returns how many entries were added to the registry.
    pub async fn restore(&self) -> Result<usize> {
        let index = LocalIndex::load(&self.index_path).await?;
        let total = index.updates.len();

        let (present, missing): (Vec<UpdateInfo>, Vec<UpdateInfo>) =
            index.updates.into_iter().partition(|update| {
                update
                    .metadata
                    .local_path
                    .as_deref()
                    .is_some_and(Path::is_file)
            });

        let mut restored = 0;
        for update in &present {
            if self.registry.add(update.clone()) {
                restored += 1;
            }
        }

        if !missing.is_empty() {
            debug!("Dropping {} local updates without a package", missing.len());
            LocalIndex { updates: present }.save(&self.index_path).await?;
        }
        if total > 0 {
            info!("Restored {} local updates", restored);
        }
        Ok(restored)
    }

    /// Stop remembering an imported update
    pub async fn forget(&self, id: &str) -> Result<()> {
        let mut index = LocalIndex::load(&self.index_path).await?;
        let before = index.updates.len();
        index.updates.retain(|update| update.id != id);
        if index.updates.len() != before {
            index.save(&self.index_path).await?;
        }
        Ok(())
    }

    fn drop_entries_for(&self, path: &Path) {
        for update in self.registry.list() {
            if update.is_local() && update.metadata.local_path.as_deref() == Some(path) {
                self.registry.remove(&update.id);
            }
        }
    }

    async fn copy_to<R>(source: &mut R, path: &Path) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = fs::File::create(path).await?;
        let size = tokio::io::copy(source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }

    /// Remove leftovers of interrupted imports
    async fn cleanup_partials(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.downloads_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let stale = name.starts_with(LOCAL_UPDATE_FILE) && name.ends_with(PARTIAL_SUFFIX);
            if stale && entry.file_type().await?.is_file() {
                debug!("Removing stale import {}", name);
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UpdateEvent, UpdateOrigin, UpdateStatus};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    /// Yields some bytes, then fails
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "source went away",
                )));
            }
            let n = self.remaining.min(buf.remaining()).min(512);
            buf.put_slice(&vec![0xAB; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    fn importer(dir: &TempDir, registry: &UpdateRegistry) -> LocalImporter {
        LocalImporter::new(
            registry.clone(),
            dir.path().join("downloads"),
            dir.path().join("cache").join("local.json"),
        )
    }

    fn local_entries(registry: &UpdateRegistry) -> Vec<UpdateInfo> {
        registry.list().into_iter().filter(|u| u.is_local()).collect()
    }

    #[tokio::test]
    async fn test_import_registers_local_update() {
        let dir = TempDir::new().unwrap();
        let registry = UpdateRegistry::new();
        let importer = importer(&dir, &registry);

        let payload = vec![7u8; 4096];
        let update = importer.import(&payload[..]).await.unwrap();

        assert_eq!(update.origin, UpdateOrigin::Local);
        assert_eq!(update.status, UpdateStatus::Unknown);
        assert!(!update.available_online);
        assert_eq!(update.metadata.size, 4096);
        assert_eq!(update.metadata.release_type, LOCAL_UPDATE_TYPE);
        assert_eq!(registry.get(&update.id), Some(update.clone()));
        assert_eq!(std::fs::read(importer.destination()).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_registry_unchanged() {
        let dir = TempDir::new().unwrap();
        let registry = UpdateRegistry::new();
        registry.add(UpdateInfo::remote("u1", 100, UpdateMetadata::default()));
        let before = registry.list();

        let importer = importer(&dir, &registry);
        let result = importer.import(FailingReader { remaining: 2048 }).await;

        assert!(matches!(result, Err(UpdateError::Import { .. })));
        assert_eq!(registry.list(), before);
        assert!(!importer.destination().exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join("downloads")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_failed_import_keeps_previous_package() {
        let dir = TempDir::new().unwrap();
        let registry = UpdateRegistry::new();
        let importer = importer(&dir, &registry);

        let first = importer.import(&b"first-package"[..]).await.unwrap();
        let result = importer.import(FailingReader { remaining: 700 }).await;

        assert!(result.is_err());
        assert_eq!(local_entries(&registry), vec![first.clone()]);
        assert_eq!(
            std::fs::read(importer.destination()).unwrap(),
            b"first-package"
        );
    }

    #[tokio::test]
    async fn test_new_import_replaces_previous_entry() {
        let dir = TempDir::new().unwrap();
        let registry = UpdateRegistry::new();
        let importer = importer(&dir, &registry);

        let first = importer.import(&b"first-package"[..]).await.unwrap();
        let mut events = registry.subscribe();
        let second = importer.import(&b"2"[..]).await.unwrap();

        assert_ne!(first.id, second.id);
        let locals = local_entries(&registry);
        assert_eq!(locals, vec![second.clone()]);

        let path = second.metadata.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"2");
        assert_eq!(second.metadata.size, 1);
        assert_eq!(events.recv().await.unwrap(), UpdateEvent::Removed(first.id));
    }

    #[tokio::test]
    async fn test_import_replaces_previous_import_only() {
        let dir = TempDir::new().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        std::fs::write(downloads.join(LOCAL_UPDATE_FILE), b"old").unwrap();
        std::fs::write(downloads.join("update.zip.deadbeef.part"), b"partial").unwrap();
        std::fs::write(downloads.join("remote-build.zip"), b"pipeline").unwrap();

        let importer = importer(&dir, &UpdateRegistry::new());
        importer.import(&b"new"[..]).await.unwrap();

        assert_eq!(std::fs::read(downloads.join(LOCAL_UPDATE_FILE)).unwrap(), b"new");
        assert!(!downloads.join("update.zip.deadbeef.part").exists());
        assert!(downloads.join("remote-build.zip").exists());
    }

    #[tokio::test]
    async fn test_import_file_missing_source() {
        let dir = TempDir::new().unwrap();
        let registry = UpdateRegistry::new();
        let importer = importer(&dir, &registry);

        let result = importer.import_file(&dir.path().join("absent.zip")).await;
        assert!(matches!(result, Err(UpdateError::Import { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = TempDir::new().unwrap();
        let imported = importer(&dir, &UpdateRegistry::new())
            .import(&b"package"[..])
            .await
            .unwrap();

        let registry = UpdateRegistry::new();
        let restarted = importer(&dir, &registry);
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(registry.get(&imported.id), Some(imported));

        // restoring twice does not duplicate
        assert_eq!(restarted.restore().await.unwrap(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_skips_missing_package() {
        let dir = TempDir::new().unwrap();
        let first = importer(&dir, &UpdateRegistry::new());
        first.import(&b"package"[..]).await.unwrap();
        std::fs::remove_file(first.destination()).unwrap();

        let registry = UpdateRegistry::new();
        let restarted = importer(&dir, &registry);
        assert_eq!(restarted.restore().await.unwrap(), 0);
        assert!(registry.is_empty());

        let index = LocalIndex::load(&dir.path().join("cache").join("local.json"))
            .await
            .unwrap();
        assert!(index.updates.is_empty());
    }

    #[tokio::test]
    async fn test_forget_removes_from_index() {
        let dir = TempDir::new().unwrap();
        let first = importer(&dir, &UpdateRegistry::new());
        let update = first.import(&b"package"[..]).await.unwrap();

        first.forget(&update.id).await.unwrap();

        let registry = UpdateRegistry::new();
        let restarted = importer(&dir, &registry);
        assert_eq!(restarted.restore().await.unwrap(), 0);
    }
}
