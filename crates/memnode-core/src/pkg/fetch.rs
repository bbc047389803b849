//! Archive download.

use super::error::PkgError;
use super::npmrc::Npmrc;
use super::registry::http_client;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Download timeout in seconds.
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Source of archive bytes.
#[async_trait]
pub trait TarballFetcher: Send + Sync {
    /// Fetch the archive at `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, PkgError>;
}

/// HTTP fetcher with a size cap and `.npmrc` bearer tokens.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
    npmrc: Npmrc,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(npmrc: Npmrc) -> Result<Self, PkgError> {
        Ok(Self::with_client(http_client()?, npmrc))
    }

    #[must_use]
    pub fn with_client(http: Client, npmrc: Npmrc) -> Self {
        Self {
            http,
            npmrc,
            max_bytes: MAX_TARBALL_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait]
impl TarballFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, PkgError> {
        let parsed = Url::parse(url)
            .map_err(|e| PkgError::download_failed(format!("Invalid tarball URL '{url}': {e}")))?;

        let mut request = self
            .http
            .get(parsed.as_str())
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS));
        if let Some(token) = self.npmrc.token_for(&parsed) {
            request = request.bearer_auth(token);
        }

        debug!(url, "downloading tarball");
        let response = request
            .send()
            .await
            .map_err(|e| PkgError::download_failed(format!("Failed to download '{url}': {e}")))?;

        if !response.status().is_success() {
            return Err(PkgError::download_failed(format!(
                "Download failed with status {} for '{url}'",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(PkgError::download_failed(format!(
                    "Tarball too large: {len} bytes (max: {})",
                    self.max_bytes
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PkgError::download_failed(format!("Failed to read response body: {e}")))?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(PkgError::download_failed(format!(
                "Tarball too large: {} bytes (max: {})",
                bytes.len(),
                self.max_bytes
            )));
        }

        Ok(bytes)
    }
}
