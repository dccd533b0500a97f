//! Build queue: bounded-concurrency job runner with ref-level deduplication.
//!
//! A FIFO queue feeds a fixed-size pool of workers. Each job walks one build
//! through fetch → analyze → attest → persist. Two safety properties hold
//! throughout:
//!
//! - **At most one in-flight analysis per (repo, ref)** within this process.
//!   A job arriving while its source revision is already being analyzed
//!   suspends on the holder's completion signal, then copies the holder's
//!   persisted report instead of re-running the analysis. If the holder
//!   failed, the duplicate re-enters the queue fresh.
//! - **The store is authoritative.** Queue and dedup state are in-memory
//!   only; after a crash, [`BuildQueue::resume_pending`] rebuilds the queue
//!   from build rows. Dropped dedup holds are safe because re-analysis of
//!   the same revision is merely redundant, never incorrect.
//!
//! Jobs are never cancelled: they run to completion, failure, or process
//! termination. Failures re-enqueue until the retry budget is exhausted,
//! after which only an operator reset re-admits the build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use vcr_core::attest::{sign_report, AttestError, AttestSigner, Provenance};

use crate::analyzer::{Analyzer, AnalyzerError};
use crate::fetcher::{FetchError, RepoFetcher};
use crate::store::{BuildRecord, BuildStatus, Store, StoreError};

/// Errors terminating a single analysis attempt. All of them route through
/// the retry policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Analyze(#[from] AnalyzerError),

    /// Signing failed; no report row is written without a signature.
    #[error(transparent)]
    Attest(#[from] AttestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("bundle serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Queue depth snapshot for the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
}

#[derive(Debug)]
struct Job {
    build_id: i64,
    app_address: String,
}

/// What a worker decided after consulting the dedup map.
enum Admission {
    /// This job owns the (repo, ref) analysis.
    Holder,
    /// Another job owns it; wait for its completion signal.
    Wait(watch::Receiver<bool>),
}

struct Shared {
    store: Store,
    fetcher: Arc<dyn RepoFetcher>,
    analyzer: Arc<dyn Analyzer>,
    signer: Arc<AttestSigner>,
    max_retries: u32,
    tx: mpsc::UnboundedSender<Job>,
    /// In-flight analyses keyed by `repoUrl@gitRef`. Process-local: a
    /// multi-instance deployment would need a storage-backed lease instead.
    inflight: Mutex<HashMap<String, watch::Sender<bool>>>,
    queued: AtomicUsize,
    running: AtomicUsize,
}

impl Shared {
    fn enqueue(&self, build_id: i64, app_address: String) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Job {
                build_id,
                app_address,
            })
            .is_err()
        {
            // Dispatcher gone; only happens during teardown.
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Handle to the build queue. Cheap to clone.
#[derive(Clone)]
pub struct BuildQueue {
    shared: Arc<Shared>,
}

impl BuildQueue {
    /// Starts the queue with a worker pool of `max_concurrent`.
    #[must_use]
    pub fn start(
        store: Store,
        fetcher: Arc<dyn RepoFetcher>,
        analyzer: Arc<dyn Analyzer>,
        signer: Arc<AttestSigner>,
        max_concurrent: usize,
        max_retries: u32,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            store,
            fetcher,
            analyzer,
            signer,
            max_retries,
            tx,
            inflight: Mutex::new(HashMap::new()),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        });
        tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            rx,
            Arc::new(Semaphore::new(max_concurrent.max(1))),
        ));
        Self { shared }
    }

    /// Appends a build to the queue.
    pub fn enqueue(&self, build_id: i64, app_address: &str) {
        self.shared.enqueue(build_id, app_address.to_string());
    }

    /// Current queue depth.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.shared.queued.load(Ordering::SeqCst),
            running: self.shared.running.load(Ordering::SeqCst),
        }
    }

    /// Crash recovery: re-admits every resumable build (pending or analyzing
    /// with retry budget left), resetting it to pending first. Returns the
    /// number of resumed builds.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn resume_pending(&self) -> Result<usize, StoreError> {
        let candidates = self.shared.store.resume_candidates(self.shared.max_retries)?;
        let count = candidates.len();
        for (build_id, app_address) in candidates {
            self.shared.store.set_status(build_id, BuildStatus::Pending)?;
            self.shared.enqueue(build_id, app_address);
        }
        if count > 0 {
            info!(count, "resumed builds from previous run");
        }
        Ok(count)
    }

    /// Operator escape hatch: resets one failed build to a fresh pending
    /// state (zero retries) and re-enqueues it, bypassing the retry cap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] if the build does not exist and
    /// [`StoreError::NotResettable`] if it has not failed.
    pub fn retry_build(&self, build_id: i64) -> Result<(), StoreError> {
        let app_address = self.shared.store.reset_build(build_id)?;
        self.shared.enqueue(build_id, app_address);
        Ok(())
    }

    /// Resets and re-enqueues every failed build of an app. Returns how many
    /// builds were re-admitted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn retry_failed(&self, app_address: &str) -> Result<usize, StoreError> {
        let ids = self.shared.store.reset_failed_for_app(app_address)?;
        let count = ids.len();
        for build_id in ids {
            self.shared.enqueue(build_id, app_address.to_string());
        }
        Ok(count)
    }
}

/// Pulls jobs in FIFO order and hands each a pool permit before spawning it.
async fn dispatch_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    pool: Arc<Semaphore>,
) {
    while let Some(job) = rx.recv().await {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
            // Semaphore closed; teardown.
            return;
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            shared.running.fetch_add(1, Ordering::SeqCst);
            process_job(&shared, &job).await;
            shared.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }
}

async fn process_job(shared: &Arc<Shared>, job: &Job) {
    let build = match shared.store.get_build(job.build_id) {
        Ok(Some(build)) => build,
        Ok(None) => {
            warn!(build_id = job.build_id, "queued build no longer exists");
            return;
        }
        Err(err) => {
            error!(build_id = job.build_id, %err, "failed to load build");
            return;
        }
    };

    // The queue can hold stale entries (duplicate wakes, manual retries
    // racing completion); the row is authoritative.
    if !matches!(build.status, BuildStatus::Pending | BuildStatus::Analyzing) {
        debug!(build_id = build.id, status = build.status.as_str(), "skipping settled build");
        return;
    }

    let (Some(repo_url), Some(git_ref)) = (build.repo_url.clone(), build.git_ref.clone()) else {
        error!(build_id = build.id, "build has no source provenance, failing");
        let _ = shared.store.set_status(build.id, BuildStatus::Failed);
        return;
    };

    if build.retries >= shared.max_retries {
        // Defensive: a stale queue entry must never push retries past the cap.
        let _ = shared.store.set_status(build.id, BuildStatus::Failed);
        return;
    }

    let dedup_key = format!("{repo_url}@{git_ref}");
    let admission = {
        let mut inflight = match shared.inflight.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("dedup map poisoned");
                return;
            }
        };
        match inflight.get(&dedup_key) {
            Some(holder) => Admission::Wait(holder.subscribe()),
            None => {
                let (signal, _) = watch::channel(false);
                inflight.insert(dedup_key.clone(), signal);
                Admission::Holder
            }
        }
    };

    match admission {
        Admission::Wait(mut done) => {
            info!(
                build_id = build.id,
                key = %dedup_key,
                "same revision already analyzing; waiting for its result"
            );
            // A closed channel also means the holder finished.
            let _ = done.changed().await;
            settle_duplicate(shared, job, &build, &repo_url, &git_ref).await;
        }
        Admission::Holder => {
            let outcome = run_attempt(shared, &build, &repo_url, &git_ref).await;
            // Status is settled before the hold is released, so woken
            // duplicates never observe a half-finished attempt.
            finish_attempt(shared, &build, &dedup_key, outcome);
        }
    }
}

/// A duplicate woke up: copy the holder's report if one exists, otherwise
/// start over from the queue.
async fn settle_duplicate(
    shared: &Arc<Shared>,
    job: &Job,
    build: &BuildRecord,
    repo_url: &str,
    git_ref: &str,
) {
    match shared.store.latest_report_for_ref(repo_url, git_ref) {
        Ok(Some(report)) => {
            let copied = shared
                .store
                .insert_report(
                    build.id,
                    &build.app_address,
                    &report.report_json,
                    &report.logs_json,
                    &report.attestation_json,
                    &report.signature,
                )
                .and_then(|_| shared.store.set_status(build.id, BuildStatus::Complete));
            match copied {
                Ok(()) => info!(build_id = build.id, "reused report from identical revision"),
                Err(err) => error!(build_id = build.id, %err, "failed to copy report"),
            }
        }
        Ok(None) => {
            // The holder failed; this build gets its own fresh attempt.
            info!(build_id = build.id, "revision analysis failed elsewhere; re-queueing");
            shared.enqueue(job.build_id, job.app_address.clone());
        }
        Err(err) => {
            error!(build_id = build.id, %err, "failed to look up shared report");
            shared.enqueue(job.build_id, job.app_address.clone());
        }
    }
}

/// Runs one full analysis attempt as the dedup holder.
async fn run_attempt(
    shared: &Arc<Shared>,
    build: &BuildRecord,
    repo_url: &str,
    git_ref: &str,
) -> Result<(), JobError> {
    shared.store.mark_analyzing(build.id)?;
    info!(
        build_id = build.id,
        app = %build.app_address,
        repo_url,
        git_ref,
        attempt = build.retries + 1,
        "analyzing build"
    );

    // Workspace cleanup is tied to this scope; every early return below
    // removes the clone.
    let workspace = shared.fetcher.fetch(repo_url, git_ref).await?;
    let outcome = shared
        .analyzer
        .analyze(workspace.path(), repo_url, workspace.commit())
        .await?;

    let provenance = Provenance {
        app_address: build.app_address.clone(),
        image_digest: build.image_digest.clone(),
        block_number: Some(build.block_number),
        verified: build.provenance_verified,
    };
    let bundle = sign_report(&shared.signer, &outcome.report, &outcome.logs, Some(provenance))?;

    shared.store.insert_report(
        build.id,
        &build.app_address,
        &serde_json::to_string(&bundle.report)?,
        &serde_json::to_string(&bundle.logs)?,
        &serde_json::to_string(&bundle.attestation)?,
        &bundle.signature,
    )?;
    Ok(())
}

/// Settles build status after an attempt and releases the dedup hold.
fn finish_attempt(
    shared: &Arc<Shared>,
    build: &BuildRecord,
    dedup_key: &str,
    outcome: Result<(), JobError>,
) {
    let attempt = build.retries + 1;
    let settled = match outcome {
        Ok(()) => {
            info!(build_id = build.id, "report generated");
            shared.store.set_status(build.id, BuildStatus::Complete)
        }
        Err(err) if attempt < shared.max_retries => {
            warn!(
                build_id = build.id,
                attempt,
                max = shared.max_retries,
                %err,
                "analysis failed, re-queueing"
            );
            let result = shared.store.set_status(build.id, BuildStatus::Pending);
            shared.enqueue(build.id, build.app_address.clone());
            result
        }
        Err(err) => {
            error!(
                build_id = build.id,
                attempt,
                %err,
                "analysis failed permanently"
            );
            shared.store.set_status(build.id, BuildStatus::Failed)
        }
    };
    if let Err(err) = settled {
        error!(build_id = build.id, %err, "failed to settle build status");
    }

    if let Ok(mut inflight) = shared.inflight.lock() {
        if let Some(signal) = inflight.remove(dedup_key) {
            let _ = signal.send(true);
        }
    }
}
