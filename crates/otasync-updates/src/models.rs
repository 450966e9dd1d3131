//! Core data models for the updates system

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an update entry came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOrigin {
    /// Listed in the server manifest
    Remote,
    /// Imported from a user supplied package file
    Local,
}

/// Lifecycle status of an update.
///
/// Owned by the download/verify/install pipeline. The registry stores and
/// republishes whatever the pipeline reports and never derives it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Unknown,
    Starting,
    Downloading,
    Paused,
    PausedError,
    Verifying,
    VerificationFailed,
    Verified,
    Installing,
    Installed,
}

/// Update fields this crate passes through without interpreting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UpdateMetadata {
    /// Package file name
    pub name: String,
    /// Version string as published
    pub version: String,
    /// Release type (channel) the package belongs to
    pub release_type: String,
    /// Package size in bytes
    pub size: u64,
    /// Download URL for remote packages
    pub download_url: Option<String>,
    /// Checksum published alongside the package
    pub checksum: Option<String>,
    /// Location on disk for locally imported packages
    pub local_path: Option<PathBuf>,
}

/// One entry of the update registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Stable unique identifier
    pub id: String,
    /// Build/publish time in seconds since the epoch
    pub timestamp: i64,
    /// Manifest or local import
    pub origin: UpdateOrigin,
    /// Pipeline-owned lifecycle status
    pub status: UpdateStatus,
    /// Still listed in the most recently fetched manifest
    pub available_online: bool,
    /// Opaque package metadata
    pub metadata: UpdateMetadata,
}

impl UpdateInfo {
    /// Create a remote entry as it appears in a freshly fetched manifest
    pub fn remote(id: impl Into<String>, timestamp: i64, metadata: UpdateMetadata) -> Self {
        Self {
            id: id.into(),
            timestamp,
            origin: UpdateOrigin::Remote,
            status: UpdateStatus::Unknown,
            available_online: true,
            metadata,
        }
    }

    /// Create an entry for a locally imported package
    pub fn local(id: impl Into<String>, timestamp: i64, metadata: UpdateMetadata) -> Self {
        Self {
            id: id.into(),
            timestamp,
            origin: UpdateOrigin::Local,
            status: UpdateStatus::Unknown,
            available_online: false,
            metadata,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == UpdateOrigin::Local
    }
}

/// Notifications published to presentation layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Status or availability of an entry changed, or the entry is new
    StatusChanged(String),
    /// Download progress reported by the pipeline
    DownloadProgress(String),
    /// Install progress reported by the pipeline
    InstallProgress(String),
    /// Entry was removed from the registry
    Removed(String),
}

impl UpdateEvent {
    /// Id of the update the event refers to
    pub fn id(&self) -> &str {
        match self {
            UpdateEvent::StatusChanged(id)
            | UpdateEvent::DownloadProgress(id)
            | UpdateEvent::InstallProgress(id)
            | UpdateEvent::Removed(id) => id,
        }
    }
}

/// User-facing result of the most recent check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// No check has finished yet
    #[default]
    Idle,
    /// Last check succeeded and updates are known
    UpdatesFound,
    /// Last check succeeded but nothing is known
    NoUpdatesFound,
    /// Last check failed
    CheckFailed,
}

/// How a single check ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Manifest fetched, merged and committed
    Success {
        /// At least one id was new to the registry
        newly_discovered: bool,
        /// The new manifest offers ids the previous one did not
        manifest_changed: bool,
    },
    /// Fetch, parse or commit failed; nothing was changed
    Failed { reason: String },
    /// The caller cancelled the check; nothing was changed
    Cancelled,
}

impl CheckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Success { .. })
    }
}

/// What started a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    /// Explicit user request
    Manual,
    /// Periodic schedule or one-shot retry
    Scheduled,
    /// No cached manifest at startup
    Startup,
    /// An update was removed and the list is refreshed
    Removal,
}

/// Report returned from a completed check
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// What started the check
    pub trigger: CheckTrigger,
    /// How the check ended
    pub outcome: CheckOutcome,
    /// User-facing status after the check
    pub status: CheckStatus,
    /// When the check finished
    pub checked_at: DateTime<Utc>,
}
