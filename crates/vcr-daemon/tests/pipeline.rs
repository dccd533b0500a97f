//! End-to-end exercises of the build queue against the real store, signer,
//! and attestation path, with the fetcher and analyzer stubbed at their
//! trait seams.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use vcr_core::attest::{verify_bundle, AttestSigner, SignedBundle};
use vcr_core::report::{Categories, CodeType, Report, TrustLabel, REPORT_VERSION};
use vcr_daemon::analyzer::{AnalysisOutcome, Analyzer, AnalyzerError};
use vcr_daemon::fetcher::{FetchError, RepoFetcher, Workspace};
use vcr_daemon::scheduler::BuildQueue;
use vcr_daemon::store::{BuildStatus, NewBuild, Store};

const APP: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const REPO: &str = "https://github.com/example/service";
const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// Hands out throwaway directories as workspaces.
struct StubFetcher;

#[async_trait]
impl RepoFetcher for StubFetcher {
    async fn fetch(&self, _repo_url: &str, _git_ref: &str) -> Result<Workspace, FetchError> {
        let path = std::env::temp_dir()
            .join("vcr-pipeline-tests")
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)?;
        Ok(Workspace::new(path, COMMIT.to_string()))
    }
}

/// Analyzer with a scripted failure prefix and an optional admission gate.
struct ScriptedAnalyzer {
    invocations: AtomicUsize,
    /// The first this many invocations fail.
    fail_first: usize,
    /// When present, each invocation waits for a permit before proceeding.
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAnalyzer {
    fn succeeding() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            fail_first: 0,
            gate: None,
        }
    }

    fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::succeeding()
        }
    }

    fn gated(fail_first: usize, gate: Arc<Semaphore>) -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            fail_first,
            gate: Some(gate),
        }
    }

    fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        _workspace: &Path,
        repo_url: &str,
        commit: &str,
    ) -> Result<AnalysisOutcome, AnalyzerError> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| AnalyzerError::NoReport)?;
            permit.forget();
        }
        if n < self.fail_first {
            return Err(AnalyzerError::Failed {
                code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(AnalysisOutcome {
            report: sample_report(repo_url, commit),
            logs: json!(["cloned", "analyzed"]),
        })
    }
}

fn sample_report(repo_url: &str, commit: &str) -> Report {
    Report {
        version: REPORT_VERSION.to_string(),
        generated_at: "2026-02-01T00:00:00Z".to_string(),
        repo_url: repo_url.to_string(),
        repo_commit: commit.to_string(),
        code_type: CodeType::Backend,
        trust_label: TrustLabel::GenerallySafe,
        trust_label_reason: "no critical findings".to_string(),
        executive_summary: "fixture".to_string(),
        categories: Categories::default(),
        markdown_summary: "# Report".to_string(),
    }
}

fn pending_build(digest_fill: char, git_ref: &str) -> NewBuild {
    NewBuild {
        app_address: APP.to_string(),
        block_number: 1480,
        image_digest: format!("sha256:{}", digest_fill.to_string().repeat(64)),
        registry: Some("registry.example.com".to_string()),
        repo_url: Some(REPO.to_string()),
        git_ref: Some(git_ref.to_string()),
        provenance_verified: true,
        status: BuildStatus::Pending,
    }
}

struct Pipeline {
    store: Store,
    signer: Arc<AttestSigner>,
    analyzer: Arc<ScriptedAnalyzer>,
    queue: BuildQueue,
}

fn pipeline(analyzer: ScriptedAnalyzer, max_concurrent: usize, max_retries: u32) -> Pipeline {
    let store = Store::open_in_memory().unwrap();
    let signer = Arc::new(AttestSigner::generate());
    let analyzer = Arc::new(analyzer);
    let queue = BuildQueue::start(
        store.clone(),
        Arc::new(StubFetcher),
        Arc::clone(&analyzer) as Arc<dyn Analyzer>,
        Arc::clone(&signer),
        max_concurrent,
        max_retries,
    );
    Pipeline {
        store,
        signer,
        analyzer,
        queue,
    }
}

async fn wait_for_status(store: &Store, build_id: i64, want: BuildStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = store.get_build(build_id).unwrap().unwrap().status;
        if status == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "build {build_id} stuck at {status:?}, wanted {want:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn bundle_from_row(row: &vcr_daemon::store::ReportRecord) -> SignedBundle {
    SignedBundle {
        report: serde_json::from_str(&row.report_json).unwrap(),
        logs: serde_json::from_str(&row.logs_json).unwrap(),
        attestation: serde_json::from_str(&row.attestation_json).unwrap(),
        signature: row.signature.clone(),
    }
}

#[tokio::test]
async fn completed_build_yields_verifiable_bundle() {
    let p = pipeline(ScriptedAnalyzer::succeeding(), 2, 2);
    let build_id = p.store.insert_build(&pending_build('a', "main")).unwrap().unwrap();
    p.queue.enqueue(build_id, APP);

    wait_for_status(&p.store, build_id, BuildStatus::Complete).await;

    let build = p.store.get_build(build_id).unwrap().unwrap();
    assert_eq!(build.retries, 1);

    let row = p.store.latest_report_for_app(APP).unwrap().unwrap();
    assert_eq!(row.build_id, build_id);
    let bundle = bundle_from_row(&row);

    // The persisted bundle must verify against the daemon's signer, and its
    // attestation must carry the build's provenance.
    verify_bundle(&bundle, p.signer.address()).unwrap();
    assert_eq!(bundle.attestation.app_address.as_deref(), Some(APP));
    assert_eq!(
        bundle.attestation.image_digest.as_deref(),
        Some(build.image_digest.as_str())
    );
    assert_eq!(bundle.attestation.block_number, Some(1480));
    assert_eq!(bundle.attestation.provenance_verified, Some(true));
    assert_eq!(bundle.report["repoCommit"], Value::from(COMMIT));
}

#[tokio::test]
async fn identical_revision_is_analyzed_once() {
    let gate = Arc::new(Semaphore::new(0));
    let p = pipeline(ScriptedAnalyzer::gated(0, Arc::clone(&gate)), 2, 2);

    let first = p.store.insert_build(&pending_build('a', "v1.0.0")).unwrap().unwrap();
    let second = p.store.insert_build(&pending_build('b', "v1.0.0")).unwrap().unwrap();
    p.queue.enqueue(first, APP);
    p.queue.enqueue(second, APP);

    // Let the holder reach the analyzer and the duplicate park behind it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.add_permits(2);

    wait_for_status(&p.store, first, BuildStatus::Complete).await;
    wait_for_status(&p.store, second, BuildStatus::Complete).await;

    assert_eq!(p.analyzer.count(), 1, "second build must reuse the report");

    // Both builds carry a report row, byte-identical analysis content.
    let reports = p.store.reports_for_app(APP, 10, 0).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].report_json, reports[1].report_json);
    assert_eq!(reports[0].logs_json, reports[1].logs_json);
    assert_ne!(reports[0].build_id, reports[1].build_id);
}

#[tokio::test]
async fn different_revisions_are_analyzed_separately() {
    let p = pipeline(ScriptedAnalyzer::succeeding(), 2, 2);
    let first = p.store.insert_build(&pending_build('a', "v1.0.0")).unwrap().unwrap();
    let second = p.store.insert_build(&pending_build('b', "v2.0.0")).unwrap().unwrap();
    p.queue.enqueue(first, APP);
    p.queue.enqueue(second, APP);

    wait_for_status(&p.store, first, BuildStatus::Complete).await;
    wait_for_status(&p.store, second, BuildStatus::Complete).await;
    assert_eq!(p.analyzer.count(), 2);
}

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let p = pipeline(ScriptedAnalyzer::failing_first(usize::MAX), 1, 2);
    let build_id = p.store.insert_build(&pending_build('a', "main")).unwrap().unwrap();
    p.queue.enqueue(build_id, APP);

    wait_for_status(&p.store, build_id, BuildStatus::Failed).await;

    let build = p.store.get_build(build_id).unwrap().unwrap();
    assert_eq!(build.retries, 2, "retries stop at the cap");
    assert_eq!(p.analyzer.count(), 2);
    assert!(p.store.latest_report_for_app(APP).unwrap().is_none());
}

#[tokio::test]
async fn manual_reset_readmits_a_failed_build() {
    // Two scripted failures exhaust the cap; the third attempt succeeds.
    let p = pipeline(ScriptedAnalyzer::failing_first(2), 1, 2);
    let build_id = p.store.insert_build(&pending_build('a', "main")).unwrap().unwrap();
    p.queue.enqueue(build_id, APP);
    wait_for_status(&p.store, build_id, BuildStatus::Failed).await;

    p.queue.retry_build(build_id).unwrap();
    wait_for_status(&p.store, build_id, BuildStatus::Complete).await;

    let build = p.store.get_build(build_id).unwrap().unwrap();
    // Reset zeroed the counter; the successful attempt is the only one since.
    assert_eq!(build.retries, 1);
    assert_eq!(p.analyzer.count(), 3);
}

#[tokio::test]
async fn retry_failed_readmits_per_app() {
    let p = pipeline(ScriptedAnalyzer::failing_first(2), 1, 1);
    let first = p.store.insert_build(&pending_build('a', "v1.0.0")).unwrap().unwrap();
    let second = p.store.insert_build(&pending_build('b', "v2.0.0")).unwrap().unwrap();
    p.queue.enqueue(first, APP);
    p.queue.enqueue(second, APP);
    wait_for_status(&p.store, first, BuildStatus::Failed).await;
    wait_for_status(&p.store, second, BuildStatus::Failed).await;

    assert_eq!(p.queue.retry_failed(APP).unwrap(), 2);
    wait_for_status(&p.store, first, BuildStatus::Complete).await;
    wait_for_status(&p.store, second, BuildStatus::Complete).await;
}

#[tokio::test]
async fn resume_pending_recovers_interrupted_builds() {
    let p = pipeline(ScriptedAnalyzer::succeeding(), 2, 2);
    let interrupted = p.store.insert_build(&pending_build('a', "v1.0.0")).unwrap().unwrap();
    let queued = p.store.insert_build(&pending_build('b', "v2.0.0")).unwrap().unwrap();
    let failed = p.store.insert_build(&pending_build('c', "v3.0.0")).unwrap().unwrap();
    // Simulate a crash mid-analysis and a terminal failure from last run.
    p.store.set_status(interrupted, BuildStatus::Analyzing).unwrap();
    p.store.set_status(failed, BuildStatus::Failed).unwrap();

    assert_eq!(p.queue.resume_pending().unwrap(), 2);

    wait_for_status(&p.store, interrupted, BuildStatus::Complete).await;
    wait_for_status(&p.store, queued, BuildStatus::Complete).await;
    assert_eq!(
        p.store.get_build(failed).unwrap().unwrap().status,
        BuildStatus::Failed
    );
}

#[tokio::test]
async fn build_without_source_fails_immediately() {
    let p = pipeline(ScriptedAnalyzer::succeeding(), 1, 2);
    let mut build = pending_build('a', "main");
    build.repo_url = None;
    build.git_ref = None;
    let build_id = p.store.insert_build(&build).unwrap().unwrap();
    p.queue.enqueue(build_id, APP);

    wait_for_status(&p.store, build_id, BuildStatus::Failed).await;
    assert_eq!(p.analyzer.count(), 0);
}

#[tokio::test]
async fn duplicate_recovers_when_holder_fails() {
    let gate = Arc::new(Semaphore::new(0));
    // First invocation fails, so the duplicate finds no report and must run
    // its own analysis.
    let p = pipeline(ScriptedAnalyzer::gated(1, Arc::clone(&gate)), 2, 1);
    let first = p.store.insert_build(&pending_build('a', "v1.0.0")).unwrap().unwrap();
    let second = p.store.insert_build(&pending_build('b', "v1.0.0")).unwrap().unwrap();
    p.queue.enqueue(first, APP);
    p.queue.enqueue(second, APP);

    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.add_permits(2);

    // One build ends failed (the holder, cap of 1), the other completes on
    // its fresh attempt after re-entering the queue.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = p.store.get_build(first).unwrap().unwrap().status;
        let b = p.store.get_build(second).unwrap().unwrap().status;
        let settled = [a, b]
            .iter()
            .all(|s| matches!(s, BuildStatus::Complete | BuildStatus::Failed));
        if settled {
            assert!(
                matches!((a, b), (BuildStatus::Failed, BuildStatus::Complete))
                    || matches!((a, b), (BuildStatus::Complete, BuildStatus::Failed)),
                "got ({a:?}, {b:?})"
            );
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck at ({a:?}, {b:?})");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p.analyzer.count(), 2);
}
