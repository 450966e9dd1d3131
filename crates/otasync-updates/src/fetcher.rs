//! Manifest download into a temp location
//!
//! A fetch never touches the committed manifest. It either leaves a complete
//! payload at the requested path or removes whatever it had written.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HttpSettings;
use crate::error::{Result, UpdateError};

/// Result of a single fetch attempt
#[derive(Debug)]
pub enum FetchOutcome {
    /// The destination holds the complete payload
    Success,
    /// The download failed; the destination was removed
    Failure(UpdateError),
    /// The caller cancelled; the destination was removed
    Cancelled,
}

/// Retrieves a manifest into a local file
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Download `url` into `destination`. Does not retry.
    async fn fetch(&self, url: &Url, destination: &Path, cancel: &CancellationToken)
        -> FetchOutcome;
}

/// Fetcher for `http(s)://` and `file://` URLs
pub struct HttpManifestFetcher {
    client: Client,
}

impl HttpManifestFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .user_agent(&settings.user_agent)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(&HttpSettings::default())
    }

    async fn download(&self, url: &Url, destination: &Path) -> Result<u64> {
        if url.scheme() == "file" {
            let source = url
                .to_file_path()
                .map_err(|_| UpdateError::config(format!("Invalid file URL: {}", url)))?;
            let copied = fs::copy(&source, destination).await?;
            fs::File::open(destination).await?.sync_all().await?;
            return Ok(copied);
        }

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status(),
            });
        }

        let mut file = fs::File::create(destination).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        debug!("Checking {}", url);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.download(url, destination) => Some(result),
        };

        match result {
            Some(Ok(bytes)) => {
                info!("Manifest downloaded ({} bytes)", bytes);
                FetchOutcome::Success
            }
            Some(Err(e)) => {
                warn!("Could not download manifest: {}", e);
                remove_partial(destination).await;
                FetchOutcome::Failure(e)
            }
            None => {
                info!("Manifest download cancelled");
                remove_partial(destination).await;
                FetchOutcome::Cancelled
            }
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove partial download {}: {}", path.display(), e);
        }
    }
}
