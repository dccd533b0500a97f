//! Build-info resolver: image digest → source provenance.
//!
//! Talks to the upstream build lookup service. Rate-limited responses are
//! retried here with exponential backoff and never surface as job failures;
//! only exhausted retries or hard transport errors propagate. A 404 means
//! the digest is unknown to the build system and maps to `None`, which the
//! poller records as an unverifiable build.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use vcr_core::config::ResolverConfig;

/// Client identifier sent with every lookup.
const CLIENT_ID: &str = "verifiable-code-reports";

/// Base backoff unit for rate-limited retries; attempt `i` waits `2^i` times
/// this long.
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Errors produced by provenance resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolverError {
    /// Transport-level failure.
    #[error("resolver transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Upstream returned an unexpected status.
    #[error("resolver returned {status} for {endpoint}")]
    UnexpectedStatus {
        endpoint: &'static str,
        status: StatusCode,
    },
}

/// Source provenance for one image digest.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildInfo {
    pub repo_url: String,
    pub git_ref: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
}

/// Result of a provenance verification request.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResult {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl VerifyResult {
    /// Whether the digest-to-source mapping was cryptographically confirmed.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status == "verified"
    }
}

/// Seam for mocking provenance lookups in tests.
#[async_trait]
pub trait ProvenanceResolver: Send + Sync {
    /// Looks up source provenance for a digest. `None` means unknown digest.
    async fn build_info(&self, image_digest: &str) -> Result<Option<BuildInfo>, ResolverError>;

    /// Asks the build system to verify the digest-to-source mapping. `None`
    /// means unknown digest.
    async fn verify_build(&self, image_digest: &str) -> Result<Option<VerifyResult>, ResolverError>;
}

/// HTTP implementation against the upstream build lookup service.
pub struct HttpResolver {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl HttpResolver {
    /// Creates a resolver from configuration.
    #[must_use]
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        }
    }

    /// Issues a GET, retrying on HTTP 429 with exponential backoff. The final
    /// attempt's response is returned whatever its status.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ResolverError> {
        for attempt in 0..self.max_retries {
            let response = self
                .client
                .get(url)
                .header("x-client-id", CLIENT_ID)
                .send()
                .await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            let wait = BACKOFF_BASE * 2u32.saturating_pow(attempt);
            warn!(url, attempt, wait_secs = wait.as_secs(), "rate limited, backing off");
            tokio::time::sleep(wait).await;
        }
        Ok(self
            .client
            .get(url)
            .header("x-client-id", CLIENT_ID)
            .send()
            .await?)
    }

    async fn fetch_optional<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: String,
    ) -> Result<Option<T>, ResolverError> {
        let response = self.get_with_retry(&url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ResolverError::UnexpectedStatus { endpoint, status }),
        }
    }
}

#[async_trait]
impl ProvenanceResolver for HttpResolver {
    async fn build_info(&self, image_digest: &str) -> Result<Option<BuildInfo>, ResolverError> {
        let url = format!("{}/builds/image/{}", self.base_url, image_digest);
        self.fetch_optional("/builds/image", url).await
    }

    async fn verify_build(
        &self,
        image_digest: &str,
    ) -> Result<Option<VerifyResult>, ResolverError> {
        let url = format!("{}/builds/verify/{}", self.base_url, image_digest);
        self.fetch_optional("/builds/verify", url).await
    }
}
