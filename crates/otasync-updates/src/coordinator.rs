//! Fetch → parse → commit → merge → reschedule
//!
//! The coordinator is the only writer of the committed manifest. A check is
//! rejected while another one runs; every failure is folded into a
//! `CheckOutcome` and a `success = false` signal for the scheduler.
//!
//! The registry merge is applied only after the rename commit succeeded, so
//! a failing commit leaves both the manifest and the registry untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::fetcher::{FetchOutcome, ManifestFetcher};
use crate::manifest::CompatibilityFilter;
use crate::models::{CheckOutcome, CheckReport, CheckStatus, CheckTrigger};
use crate::registry::UpdateRegistry;
use crate::schedule::ScheduleManager;
use crate::store::{CheckHistory, ManifestStore};

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Merging,
    Committing,
    Failed,
}

#[derive(Debug, Clone)]
struct SyncSettings {
    url: Url,
    filter: CompatibilityFilter,
}

impl SyncSettings {
    fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Ok(Self {
            url: config.server_url()?,
            filter: CompatibilityFilter::new(
                config.build.clone(),
                config.channel.clone(),
                config.allow_downgrades,
            ),
        })
    }
}

/// Returns the coordinator to `Idle` however a check ends
struct StateGuard<'a> {
    state: &'a Mutex<SyncState>,
}

impl<'a> StateGuard<'a> {
    fn set(&self, next: SyncState) {
        debug!("Sync state -> {:?}", next);
        *self.state.lock() = next;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = SyncState::Idle;
    }
}

/// Why a check did not succeed
enum Failure {
    Error(UpdateError),
    Cancelled,
}

/// Orchestrates manifest checks
pub struct SyncCoordinator {
    fetcher: Arc<dyn ManifestFetcher>,
    store: ManifestStore,
    registry: UpdateRegistry,
    schedule: Arc<ScheduleManager>,
    history_path: PathBuf,
    settings: RwLock<SyncSettings>,
    state: Mutex<SyncState>,
    status: Mutex<CheckStatus>,
}

impl SyncCoordinator {
    pub fn new(
        config: &UpdaterConfig,
        fetcher: Arc<dyn ManifestFetcher>,
        registry: UpdateRegistry,
        schedule: Arc<ScheduleManager>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher,
            store: ManifestStore::new(config.manifest_path()),
            registry,
            schedule,
            history_path: config.history_path(),
            settings: RwLock::new(SyncSettings::from_config(config)?),
            state: Mutex::new(SyncState::Idle),
            status: Mutex::new(CheckStatus::Idle),
        })
    }

    /// Pick up a changed server URL, channel or build
    pub fn update_config(&self, config: &UpdaterConfig) -> Result<()> {
        *self.settings.write() = SyncSettings::from_config(config)?;
        Ok(())
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn status(&self) -> CheckStatus {
        *self.status.lock()
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn registry(&self) -> &UpdateRegistry {
        &self.registry
    }

    /// Time of the last successful check
    pub async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(CheckHistory::load(&self.history_path).await?.last_check)
    }

    fn begin(&self, next: SyncState) -> Result<StateGuard<'_>> {
        let mut state = self.state.lock();
        if *state != SyncState::Idle {
            debug!("Rejecting request, coordinator is {:?}", *state);
            return Err(UpdateError::CheckInProgress);
        }
        *state = next;
        Ok(StateGuard { state: &self.state })
    }

    /// Merge the committed manifest into the registry without fetching.
    ///
    /// Returns whether a committed manifest exists. A manifest that cannot be
    /// parsed is logged and leaves the registry untouched.
    pub async fn load_cached(&self) -> Result<bool> {
        let _guard = self.begin(SyncState::Merging)?;
        let filter = self.settings.read().filter.clone();

        match self.store.load().await {
            Ok(Some(manifest)) => {
                self.registry.merge(manifest.compatible(&filter).to_updates());
                info!("Cached manifest loaded");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                error!("Error while parsing cached manifest: {}", e);
                Ok(true)
            }
        }
    }

    /// Run one check.
    ///
    /// Only a concurrent check yields an `Err`; every other problem ends up
    /// in the returned report.
    pub async fn check(
        &self,
        trigger: CheckTrigger,
        cancel: &CancellationToken,
    ) -> Result<CheckReport> {
        let guard = self.begin(SyncState::Fetching)?;
        let SyncSettings { url, filter } = self.settings.read().clone();
        let temp = self.store.temp_path();
        info!("Update check ({:?}) against {}", trigger, url);

        let outcome = match self.run_check(&guard, &url, &filter, &temp, cancel).await {
            Ok((newly_discovered, manifest_changed)) => {
                self.schedule.on_check_outcome(true, manifest_changed);
                let status = if self.registry.is_empty() {
                    CheckStatus::NoUpdatesFound
                } else {
                    CheckStatus::UpdatesFound
                };
                *self.status.lock() = status;
                CheckOutcome::Success {
                    newly_discovered,
                    manifest_changed,
                }
            }
            Err(failure) => {
                guard.set(SyncState::Failed);
                ManifestStore::discard(&temp).await;
                self.schedule.on_check_outcome(false, false);
                match failure {
                    Failure::Cancelled => {
                        info!("Update check cancelled");
                        CheckOutcome::Cancelled
                    }
                    Failure::Error(e) => {
                        if e.is_transient() {
                            warn!("Update check failed, will retry: {}", e);
                        } else {
                            error!("Update check failed: {}", e);
                        }
                        *self.status.lock() = CheckStatus::CheckFailed;
                        CheckOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        Ok(CheckReport {
            trigger,
            outcome,
            status: self.status(),
            checked_at: Utc::now(),
        })
    }

    async fn run_check(
        &self,
        guard: &StateGuard<'_>,
        url: &Url,
        filter: &CompatibilityFilter,
        temp: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<(bool, bool), Failure> {
        self.store.ensure_dir().await.map_err(Failure::Error)?;

        match self.fetcher.fetch(url, temp, cancel).await {
            FetchOutcome::Success => debug!("List downloaded"),
            FetchOutcome::Failure(e) => return Err(Failure::Error(e)),
            FetchOutcome::Cancelled => return Err(Failure::Cancelled),
        }

        guard.set(SyncState::Merging);
        let manifest = ManifestStore::read_manifest(temp)
            .await
            .map_err(Failure::Error)?
            .compatible(filter);
        let manifest_changed = self
            .store
            .introduces_new_ids(&manifest, filter)
            .await
            .map_err(Failure::Error)?;

        if cancel.is_cancelled() {
            return Err(Failure::Cancelled);
        }

        guard.set(SyncState::Committing);
        self.store.commit(temp).await.map_err(Failure::Error)?;
        let newly_discovered = self.registry.merge(manifest.to_updates());

        let history = CheckHistory {
            last_check: Some(Utc::now()),
        };
        if let Err(e) = history.save(&self.history_path).await {
            warn!("Could not record check time: {}", e);
        }

        Ok((newly_discovered, manifest_changed))
    }
}
