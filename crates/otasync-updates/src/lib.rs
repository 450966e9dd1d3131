//! OTA update manifest synchronization
//!
//! Keeps a local copy of the server's update manifest in sync and maintains
//! the registry of updates the device can install.
//!
//! ## Features
//!
//! - **Atomic manifest commits**: a failed or cancelled check never corrupts the cached manifest
//! - **Registry**: remote and locally imported updates with availability tracking and events
//! - **Scheduling**: periodic checks plus a single one-shot retry after failures
//! - **Local import**: register a user supplied package next to the remote ones

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod importer;
pub mod manifest;
pub mod models;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::{CheckInterval, ConfigLoader, DeviceBuild, HttpSettings, UpdaterConfig};
pub use coordinator::{SyncCoordinator, SyncState};
pub use error::{Result, UpdateError};
pub use fetcher::{FetchOutcome, HttpManifestFetcher, ManifestFetcher};
pub use importer::{LocalImporter, LOCAL_UPDATE_FILE, LOCAL_UPDATE_TYPE};
pub use manifest::{CompatibilityFilter, Manifest, ManifestEntry};
pub use models::{
    CheckOutcome, CheckReport, CheckStatus, CheckTrigger, UpdateEvent, UpdateInfo,
    UpdateMetadata, UpdateOrigin, UpdateStatus,
};
pub use registry::UpdateRegistry;
pub use schedule::{CheckTimer, ScheduleManager, ScheduleState, ScheduledCheck, TokioCheckTimer};
pub use service::UpdaterService;
pub use store::{CheckHistory, ManifestStore};

/// Re-export for callers driving cancellation
pub use tokio_util::sync::CancellationToken;
