//! Error types for the updates crate

use thiserror::Error;

/// Result type alias for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Error type for manifest synchronization, registry and import operations
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network-related errors while fetching the manifest
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    /// I/O errors during file operations
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON parsing errors
    #[error("JSON parsing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Configuration loading errors
    #[error("Configuration loading failed: {source}")]
    ConfigLoad {
        #[from]
        source: config::ConfigError,
    },

    /// The update server answered with a non-success status
    #[error("Server returned status {status}")]
    HttpStatus { status: reqwest::StatusCode },

    /// The manifest could not be interpreted
    #[error("Malformed manifest: {message}")]
    MalformedManifest { message: String },

    /// A check was requested while another one is running
    #[error("An update check is already in progress")]
    CheckInProgress,

    /// Replacing the committed manifest failed
    #[error("Manifest commit failed: {message}")]
    Commit { message: String },

    /// Local package import failed
    #[error("Import failed: {message}")]
    Import { message: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Unknown update id
    #[error("Update not found: {id}")]
    NotFound { id: String },
}

impl UpdateError {
    /// Create a new malformed manifest error
    pub fn malformed_manifest<S: Into<String>>(message: S) -> Self {
        Self::MalformedManifest {
            message: message.into(),
        }
    }

    /// Create a new commit error
    pub fn commit<S: Into<String>>(message: S) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }

    /// Create a new import error
    pub fn import<S: Into<String>>(message: S) -> Self {
        Self::Import {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Whether the failure is likely to go away on its own (network hiccups, 5xx)
    pub fn is_transient(&self) -> bool {
        match self {
            UpdateError::Network { source } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            UpdateError::HttpStatus { status } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            UpdateError::Io { source } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
