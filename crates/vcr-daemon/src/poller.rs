//! Chain watcher: turns on-chain release events into build rows.
//!
//! Each tick scans every monitored app independently; one app's RPC trouble
//! never stalls the others. The per-app block cursor only moves forward after
//! a full range was ingested, so a crash mid-scan produces an overlapping
//! re-scan on restart. That overlap is safe: build rows are keyed by
//! (app, digest) and re-discovered releases collapse onto the existing row.
//!
//! Provenance that cannot be resolved (unknown digest, resolver failure, or
//! source strings that fail validation) yields a terminal `unverifiable`
//! build. A resolved-but-unconfirmed mapping still gets analyzed, flagged
//! `provenance_verified = false` in its attestation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use vcr_core::sanitize::{sanitize_git_ref, sanitize_repo_url};

use crate::chain::{AppUpgradedEvent, ChainError, ChainReader};
use crate::resolver::ProvenanceResolver;
use crate::scheduler::BuildQueue;
use crate::store::{BuildStatus, MonitoredApp, NewBuild, Store, StoreError};

/// Errors terminating one app's scan. Logged and isolated per app.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PollError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where newly ingested builds go. [`BuildQueue`] in production; tests record.
pub trait EnqueueSink: Send + Sync {
    fn enqueue_build(&self, build_id: i64, app_address: &str);
}

impl EnqueueSink for BuildQueue {
    fn enqueue_build(&self, build_id: i64, app_address: &str) {
        self.enqueue(build_id, app_address);
    }
}

/// Scan tuning, lifted from chain and resolver configuration.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    /// First-scan floor: the registry contract's deployment block.
    pub start_block: u64,
    /// Extra blocks scanned past the latest release pointer.
    pub block_buffer: u64,
    /// Pause before each provenance lookup, to stay under upstream limits.
    pub resolver_call_delay: Duration,
}

/// The chain watcher.
pub struct Poller {
    store: Store,
    chain: Arc<dyn ChainReader>,
    resolver: Arc<dyn ProvenanceResolver>,
    sink: Arc<dyn EnqueueSink>,
    settings: PollerSettings,
}

/// Outcome of resolving one digest to its source.
enum Resolution {
    Resolved {
        repo_url: String,
        git_ref: String,
        verified: bool,
    },
    Unverifiable,
}

impl Poller {
    #[must_use]
    pub fn new(
        store: Store,
        chain: Arc<dyn ChainReader>,
        resolver: Arc<dyn ProvenanceResolver>,
        sink: Arc<dyn EnqueueSink>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            chain,
            resolver,
            sink,
            settings,
        }
    }

    /// Runs the scan loop forever. A tick that overruns the interval delays
    /// the next one rather than bursting.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_all().await;
        }
    }

    /// Scans every monitored app once, isolating failures per app.
    pub async fn poll_all(&self) {
        let apps = match self.store.list_apps() {
            Ok(apps) => apps,
            Err(err) => {
                error!(%err, "failed to list monitored apps");
                return;
            }
        };
        for app in apps {
            if let Err(err) = self.poll_app(&app).await {
                error!(app = %app.app_address, %err, "app scan failed");
            }
        }
    }

    /// Scans one app's new block range for release events.
    ///
    /// # Errors
    ///
    /// Returns an error on chain or database failure; the block cursor is
    /// left untouched so the range is re-scanned next tick.
    pub async fn poll_app(&self, app: &MonitoredApp) -> Result<(), PollError> {
        let latest = self.chain.latest_release_block(&app.app_address).await?;
        if latest <= app.last_seen_block {
            debug!(app = %app.app_address, latest, "no new releases");
            return Ok(());
        }

        let from = if app.last_seen_block == 0 {
            self.settings.start_block
        } else {
            app.last_seen_block + 1
        };
        let to = latest + self.settings.block_buffer;
        info!(app = %app.app_address, from, to, "scanning for releases");

        let events = self
            .chain
            .app_upgraded_events(&app.app_address, from, to)
            .await?;
        for event in events {
            self.ingest_event(&app.app_address, &event).await?;
        }

        // Advance to the release pointer, not the buffered top: the buffer
        // region is deliberately re-covered by the next scan.
        self.store.advance_last_seen_block(&app.app_address, latest)?;
        Ok(())
    }

    /// Records one release event as a build row, resolving its provenance.
    async fn ingest_event(
        &self,
        app_address: &str,
        event: &AppUpgradedEvent,
    ) -> Result<(), PollError> {
        let Some(artifact) = event.payload.artifacts.first() else {
            warn!(
                app = %app_address,
                release_id = event.payload.release_id,
                "release event carries no artifacts"
            );
            return Ok(());
        };
        let image_digest = artifact.image_digest();

        if self.store.build_exists(app_address, &image_digest)? {
            debug!(app = %app_address, digest = %image_digest, "build already recorded");
            return Ok(());
        }

        tokio::time::sleep(self.settings.resolver_call_delay).await;
        let resolution = self.resolve_provenance(&image_digest).await;

        let build = match resolution {
            Resolution::Resolved {
                repo_url,
                git_ref,
                verified,
            } => NewBuild {
                app_address: app_address.to_string(),
                block_number: event.block_number,
                image_digest: image_digest.clone(),
                registry: Some(artifact.registry.clone()),
                repo_url: Some(repo_url),
                git_ref: Some(git_ref),
                provenance_verified: verified,
                status: BuildStatus::Pending,
            },
            Resolution::Unverifiable => NewBuild {
                app_address: app_address.to_string(),
                block_number: event.block_number,
                image_digest: image_digest.clone(),
                registry: Some(artifact.registry.clone()),
                repo_url: None,
                git_ref: None,
                provenance_verified: false,
                status: BuildStatus::Unverifiable,
            },
        };

        let Some(build_id) = self.store.insert_build(&build)? else {
            // Lost a race with an overlapping scan; the earlier row stands.
            return Ok(());
        };

        match build.status {
            BuildStatus::Pending => {
                info!(
                    app = %app_address,
                    build_id,
                    digest = %image_digest,
                    block = event.block_number,
                    verified = build.provenance_verified,
                    "new build queued for analysis"
                );
                self.sink.enqueue_build(build_id, app_address);
            }
            _ => {
                warn!(
                    app = %app_address,
                    build_id,
                    digest = %image_digest,
                    "build recorded as unverifiable"
                );
            }
        }
        Ok(())
    }

    /// Maps a digest to validated source provenance. Every failure mode
    /// collapses to [`Resolution::Unverifiable`]; only verification itself
    /// degrades softly to `verified = false`.
    async fn resolve_provenance(&self, image_digest: &str) -> Resolution {
        let info = match self.resolver.build_info(image_digest).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(digest = %image_digest, "digest unknown to build system");
                return Resolution::Unverifiable;
            }
            Err(err) => {
                warn!(digest = %image_digest, %err, "provenance lookup failed");
                return Resolution::Unverifiable;
            }
        };

        let repo_url = match sanitize_repo_url(&info.repo_url) {
            Ok(url) => url,
            Err(err) => {
                warn!(digest = %image_digest, %err, "rejecting unsafe repo url");
                return Resolution::Unverifiable;
            }
        };
        let git_ref = match sanitize_git_ref(&info.git_ref) {
            Ok(r) => r,
            Err(err) => {
                warn!(digest = %image_digest, %err, "rejecting unsafe git ref");
                return Resolution::Unverifiable;
            }
        };

        let verified = match self.resolver.verify_build(image_digest).await {
            Ok(Some(result)) => result.is_verified(),
            Ok(None) => false,
            Err(err) => {
                // The source is known; a verification hiccup downgrades the
                // attestation instead of blocking analysis.
                warn!(digest = %image_digest, %err, "provenance verification failed");
                false
            }
        };

        Resolution::Resolved {
            repo_url,
            git_ref,
            verified,
        }
    }
}
