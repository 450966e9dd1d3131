//! Long-lived updater context
//!
//! Owns the registry, the coordinator, the schedule and the importer, and
//! wires scheduled ticks into checks. Collaborators get cloned handles.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::coordinator::{SyncCoordinator, SyncState};
use crate::error::{Result, UpdateError};
use crate::fetcher::{HttpManifestFetcher, ManifestFetcher};
use crate::importer::LocalImporter;
use crate::models::{CheckReport, CheckStatus, CheckTrigger, UpdateInfo};
use crate::registry::UpdateRegistry;
use crate::schedule::{CheckTimer, ScheduleManager, ScheduleState, ScheduledCheck, TokioCheckTimer};

/// Clears the in-flight slot however a check ends
struct InFlight<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Updater service
pub struct UpdaterService {
    config: RwLock<UpdaterConfig>,
    registry: UpdateRegistry,
    coordinator: SyncCoordinator,
    schedule: Arc<ScheduleManager>,
    importer: LocalImporter,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl UpdaterService {
    pub fn new(
        config: UpdaterConfig,
        fetcher: Arc<dyn ManifestFetcher>,
        timer: Arc<dyn CheckTimer>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = UpdateRegistry::new();
        let schedule = Arc::new(ScheduleManager::new(
            timer,
            config.auto_check,
            config.check_interval.as_duration(),
            config.retry_delay(),
        ));
        let coordinator =
            SyncCoordinator::new(&config, fetcher, registry.clone(), schedule.clone())?;
        let importer = LocalImporter::new(
            registry.clone(),
            config.downloads_dir.clone(),
            config.local_index_path(),
        );

        Ok(Self {
            config: RwLock::new(config),
            registry,
            coordinator,
            schedule,
            importer,
            in_flight: Mutex::new(None),
        })
    }

    /// Service backed by the HTTP fetcher and tokio timers.
    ///
    /// Feed the returned receiver to [`UpdaterService::run`].
    pub fn with_tokio_timer(
        config: UpdaterConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScheduledCheck>)> {
        let fetcher = Arc::new(HttpManifestFetcher::new(&config.http)?);
        let (timer, ticks) = TokioCheckTimer::new();
        let service = Self::new(config, fetcher, Arc::new(timer))?;
        Ok((service, ticks))
    }

    /// Handle to the shared registry
    pub fn registry(&self) -> UpdateRegistry {
        self.registry.clone()
    }

    pub fn config(&self) -> UpdaterConfig {
        self.config.read().clone()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> CheckStatus {
        self.coordinator.status()
    }

    pub fn state(&self) -> SyncState {
        self.coordinator.state()
    }

    pub fn schedule_state(&self) -> ScheduleState {
        self.schedule.snapshot()
    }

    pub async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
        self.coordinator.last_check().await
    }

    /// SHA-256 of the committed manifest
    pub async fn manifest_digest(&self) -> Result<Option<String>> {
        self.coordinator.store().digest().await
    }

    /// Load the committed manifest and the recorded local imports.
    ///
    /// Returns whether a committed manifest exists.
    pub async fn load_cached(&self) -> Result<bool> {
        let cached = self.coordinator.load_cached().await?;
        if let Err(e) = self.importer.restore().await {
            warn!("Could not restore local updates: {}", e);
        }
        Ok(cached)
    }

    /// Bring the service up.
    ///
    /// Cleans leftovers of interrupted fetches, loads the cached manifest or
    /// checks when there is none, then applies the schedule configuration.
    pub async fn start(&self) -> Result<Option<CheckReport>> {
        match self.coordinator.store().cleanup_orphans().await {
            Ok(0) => {}
            Ok(removed) => debug!("Cleaned {} orphaned downloads", removed),
            Err(e) => warn!("Could not clean orphaned downloads: {}", e),
        }

        let report = if self.load_cached().await? {
            None
        } else {
            info!("No cached manifest, checking for updates");
            Some(self.check_now(CheckTrigger::Startup).await?)
        };

        let (enabled, interval) = {
            let config = self.config.read();
            (config.auto_check, config.check_interval.as_duration())
        };
        self.schedule.apply_config(enabled, interval);
        Ok(report)
    }

    /// Run a check now
    pub async fn check_now(&self, trigger: CheckTrigger) -> Result<CheckReport> {
        self.check_with(trigger, CancellationToken::new()).await
    }

    async fn check_with(
        &self,
        trigger: CheckTrigger,
        cancel: CancellationToken,
    ) -> Result<CheckReport> {
        let _in_flight = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.is_some() {
                return Err(UpdateError::CheckInProgress);
            }
            *in_flight = Some(cancel.clone());
            InFlight {
                slot: &self.in_flight,
            }
        };

        self.coordinator.check(trigger, &cancel).await
    }

    /// Cancel the running check, if any
    pub fn cancel_check(&self) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Import a package from a reader
    pub async fn import<R>(&self, source: R) -> Result<UpdateInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.importer.import(source).await
    }

    /// Import a package file
    pub async fn import_file(&self, path: &Path) -> Result<UpdateInfo> {
        self.importer.import_file(path).await
    }

    /// An update was deleted; drop it and refresh the list
    pub async fn handle_update_removed(&self, id: &str) -> Result<CheckReport> {
        let removed = self
            .registry
            .remove(id)
            .ok_or_else(|| UpdateError::not_found(id))?;
        if removed.is_local() {
            self.importer.forget(id).await?;
        }
        self.check_now(CheckTrigger::Removal).await
    }

    /// Apply changed settings.
    ///
    /// Paths are fixed at construction; URL, channel, build and schedule
    /// settings take effect for the next check.
    pub fn apply_config(&self, config: UpdaterConfig) -> Result<()> {
        config.validate()?;
        self.coordinator.update_config(&config)?;
        self.schedule
            .apply_config(config.auto_check, config.check_interval.as_duration());
        *self.config.write() = config;
        Ok(())
    }

    /// Run scheduled checks until `shutdown` is cancelled or the ticks end
    pub async fn run(
        &self,
        mut ticks: mpsc::UnboundedReceiver<ScheduledCheck>,
        shutdown: CancellationToken,
    ) {
        info!("Updater service running");
        loop {
            let tick = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => tick,
                    None => break,
                },
            };

            debug!("Scheduled check fired: {:?}", tick);
            if tick == ScheduledCheck::Retry {
                self.schedule.on_retry_fired();
            }

            match self
                .check_with(CheckTrigger::Scheduled, shutdown.child_token())
                .await
            {
                Ok(report) => debug!("Scheduled check finished: {:?}", report.outcome),
                Err(UpdateError::CheckInProgress) => {
                    debug!("Skipping scheduled check, one is already running")
                }
                Err(e) => warn!("Scheduled check failed: {}", e),
            }
        }
        info!("Updater service stopped");
    }
}
