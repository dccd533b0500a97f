//! Operator HTTP surface.
//!
//! Thin handlers over the store and the build queue: every path parameter
//! that names an app is sanitized before it touches storage, report payloads
//! are served as the JSON they were signed over, and the only mutating
//! endpoints are registration and the two retry escape hatches.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use vcr_core::sanitize::{sanitize_address, sanitize_limit, sanitize_offset, SanitizeError};

use crate::chain::ChainReader;
use crate::scheduler::BuildQueue;
use crate::store::{BuildRecord, ReportRecord, Store, StoreError};

const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub queue: BuildQueue,
    pub chain: Arc<dyn ChainReader>,
    /// EIP-55 address of the attestation signer, surfaced for clients that
    /// pin the expected signer identity.
    pub signer_address: String,
}

/// Error surface of the operator API.
enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    /// The app exists as an address but is not registered on-chain.
    NotRegisteredOnChain,
    /// The request names a real resource whose current state forbids it.
    Conflict(String),
    Internal,
}

impl From<SanitizeError> for ApiError {
    fn from(err: SanitizeError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BuildNotFound(_) => Self::NotFound("build not found"),
            not_resettable @ StoreError::NotResettable { .. } => {
                Self::Conflict(not_resettable.to_string())
            }
            other => {
                error!(err = %other, "store error serving api request");
                Self::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message.to_string()),
            Self::NotRegisteredOnChain => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "app is not registered on-chain".to_string(),
            ),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RegisterRequest {
    app_address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildView {
    id: i64,
    app_address: String,
    block_number: u64,
    image_digest: String,
    registry: Option<String>,
    repo_url: Option<String>,
    git_ref: Option<String>,
    provenance_verified: bool,
    status: &'static str,
    retries: u32,
    created_at: i64,
}

impl From<BuildRecord> for BuildView {
    fn from(build: BuildRecord) -> Self {
        Self {
            id: build.id,
            app_address: build.app_address,
            block_number: build.block_number,
            image_digest: build.image_digest,
            registry: build.registry,
            repo_url: build.repo_url,
            git_ref: build.git_ref,
            provenance_verified: build.provenance_verified,
            status: build.status.as_str(),
            retries: build.retries,
            created_at: build.created_at,
        }
    }
}

#[derive(Deserialize, Default)]
struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

/// Builds the operator router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/apps", post(register_app))
        .route("/apps/:address/reports", get(list_reports))
        .route("/apps/:address/reports/latest", get(latest_report))
        .route("/apps/:address/builds", get(list_builds))
        .route("/apps/:address/retry-failed", post(retry_failed))
        .route("/builds/:id/logs", get(build_logs))
        .route("/builds/:id/retry", post(retry_build))
        .route("/health", get(health))
        .with_state(state)
}

async fn register_app(
    State(state): State<ApiState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let address = sanitize_address(&body.app_address)?;

    let status = state.chain.app_status(&address).await.map_err(|err| {
        error!(app = %address, %err, "on-chain status check failed");
        ApiError::Internal
    })?;
    if status == 0 {
        return Err(ApiError::NotRegisteredOnChain);
    }

    let created = state.store.register_app(&address)?;
    if created {
        info!(app = %address, "app registered for monitoring");
    }
    let code = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((code, Json(json!({ "appAddress": address }))).into_response())
}

/// Parses a stored report row back into the JSON it was signed over.
fn report_view(record: ReportRecord) -> Result<Value, ApiError> {
    let assemble = || -> Result<Value, serde_json::Error> {
        Ok(json!({
            "id": record.id,
            "buildId": record.build_id,
            "appAddress": record.app_address,
            "report": serde_json::from_str::<Value>(&record.report_json)?,
            "attestation": serde_json::from_str::<Value>(&record.attestation_json)?,
            "signature": record.signature,
            "createdAt": record.created_at,
        }))
    };
    assemble().map_err(|err| {
        error!(report_id = record.id, %err, "stored report is not valid json");
        ApiError::Internal
    })
}

async fn list_reports(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let address = sanitize_address(&address)?;
    let limit = sanitize_limit(page.limit.as_deref(), MAX_PAGE_SIZE, DEFAULT_PAGE_SIZE);
    let offset = sanitize_offset(page.offset.as_deref());

    let reports = state
        .store
        .reports_for_app(&address, limit, offset)?
        .into_iter()
        .map(report_view)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({
        "appAddress": address,
        "limit": limit,
        "offset": offset,
        "reports": reports,
    })))
}

async fn latest_report(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let address = sanitize_address(&address)?;
    let record = state
        .store
        .latest_report_for_app(&address)?
        .ok_or(ApiError::NotFound("no reports for app"))?;
    Ok(Json(report_view(record)?))
}

async fn list_builds(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<BuildView>>, ApiError> {
    let address = sanitize_address(&address)?;
    let builds = state
        .store
        .builds_for_app(&address)?
        .into_iter()
        .map(BuildView::from)
        .collect();
    Ok(Json(builds))
}

async fn build_logs(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let logs_json = state
        .store
        .logs_for_build(id)?
        .ok_or(ApiError::NotFound("no logs for build"))?;
    let logs: Value = serde_json::from_str(&logs_json).map_err(|err| {
        error!(build_id = id, %err, "stored logs are not valid json");
        ApiError::Internal
    })?;
    Ok(Json(json!({ "buildId": id, "logs": logs })))
}

async fn retry_build(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.queue.retry_build(id)?;
    info!(build_id = id, "build manually re-queued");
    Ok(Json(json!({ "buildId": id, "status": "pending" })))
}

async fn retry_failed(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let address = sanitize_address(&address)?;
    let count = state.queue.retry_failed(&address)?;
    info!(app = %address, count, "failed builds re-queued");
    Ok(Json(json!({ "appAddress": address, "retried": count })))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let queue = state.queue.status();
    Json(json!({
        "status": "ok",
        "signerAddress": state.signer_address,
        "queue": queue,
    }))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::chain::{AppUpgradedEvent, ChainError};
    use crate::fetcher::{FetchError, RepoFetcher, Workspace};
    use crate::analyzer::{AnalysisOutcome, Analyzer, AnalyzerError};
    use vcr_core::attest::AttestSigner;

    const APP: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    struct FixedChain {
        status: u64,
    }

    #[async_trait]
    impl ChainReader for FixedChain {
        async fn app_status(&self, _app: &str) -> Result<u64, ChainError> {
            Ok(self.status)
        }

        async fn latest_release_block(&self, _app: &str) -> Result<u64, ChainError> {
            Ok(0)
        }

        async fn app_upgraded_events(
            &self,
            _app: &str,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<AppUpgradedEvent>, ChainError> {
            Ok(Vec::new())
        }
    }

    struct NoopFetcher;

    #[async_trait]
    impl RepoFetcher for NoopFetcher {
        async fn fetch(&self, _repo_url: &str, _git_ref: &str) -> Result<Workspace, FetchError> {
            Err(FetchError::CloneFailed {
                stderr: "unused".to_string(),
            })
        }
    }

    struct NoopAnalyzer;

    #[async_trait]
    impl Analyzer for NoopAnalyzer {
        async fn analyze(
            &self,
            _workspace: &std::path::Path,
            _repo_url: &str,
            _commit: &str,
        ) -> Result<AnalysisOutcome, AnalyzerError> {
            Err(AnalyzerError::NoReport)
        }
    }

    fn test_state(chain_status: u64) -> ApiState {
        let store = Store::open_in_memory().unwrap();
        let signer = Arc::new(AttestSigner::generate());
        let queue = BuildQueue::start(
            store.clone(),
            Arc::new(NoopFetcher),
            Arc::new(NoopAnalyzer),
            Arc::clone(&signer),
            1,
            2,
        );
        ApiState {
            store,
            queue,
            chain: Arc::new(FixedChain {
                status: chain_status,
            }),
            signer_address: signer.address().to_string(),
        }
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn register_checks_chain_and_is_idempotent() {
        let state = test_state(1);
        let router = router(state.clone());

        let (status, body) = call(
            router.clone(),
            post_json("/apps", json!({ "appAddress": APP.to_lowercase() })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        // Lowercase input comes back checksummed.
        assert_eq!(body["appAddress"], APP);

        let (status, _) = call(router, post_json("/apps", json!({ "appAddress": APP }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn register_rejects_unregistered_and_malformed() {
        let state = test_state(0);
        let router = router(state);

        let (status, _) = call(
            router.clone(),
            post_json("/apps", json!({ "appAddress": APP })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            router,
            post_json("/apps", json!({ "appAddress": "not-an-address" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reports_paging_clamps_and_serves_json() {
        let state = test_state(1);
        let build_id = state
            .store
            .insert_build(&crate::store::NewBuild {
                app_address: APP.to_string(),
                block_number: 1,
                image_digest: format!("sha256:{}", "a".repeat(64)),
                registry: None,
                repo_url: Some("https://github.com/x/y".to_string()),
                git_ref: Some("main".to_string()),
                provenance_verified: true,
                status: crate::store::BuildStatus::Complete,
            })
            .unwrap()
            .unwrap();
        state
            .store
            .insert_report(build_id, APP, r#"{"v":1}"#, "[]", "{}", "0xsig")
            .unwrap();
        let router = router(state);

        let uri = format!("/apps/{APP}/reports?limit=9999&offset=0");
        let (status, body) = call(
            router.clone(),
            Request::get(&uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], MAX_PAGE_SIZE);
        assert_eq!(body["reports"][0]["report"]["v"], 1);
        assert_eq!(body["reports"][0]["signature"], "0xsig");

        let (status, body) = call(
            router,
            Request::get(&format!("/apps/{APP}/reports/latest"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["buildId"], build_id);
    }

    #[tokio::test]
    async fn missing_resources_are_404() {
        let state = test_state(1);
        let router = router(state);

        let (status, _) = call(
            router.clone(),
            Request::get(&format!("/apps/{APP}/reports/latest"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            router.clone(),
            Request::get("/builds/42/logs").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            router,
            Request::post("/builds/42/retry").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retrying_a_completed_build_is_a_conflict() {
        let state = test_state(1);
        let build_id = state
            .store
            .insert_build(&crate::store::NewBuild {
                app_address: APP.to_string(),
                block_number: 1,
                image_digest: format!("sha256:{}", "b".repeat(64)),
                registry: None,
                repo_url: Some("https://github.com/x/y".to_string()),
                git_ref: Some("main".to_string()),
                provenance_verified: true,
                status: crate::store::BuildStatus::Complete,
            })
            .unwrap()
            .unwrap();
        let router = router(state.clone());

        let (status, body) = call(
            router,
            Request::post(&format!("/builds/{build_id}/retry"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("complete"));
        assert_eq!(
            state.store.get_build(build_id).unwrap().unwrap().status,
            crate::store::BuildStatus::Complete
        );
    }

    #[tokio::test]
    async fn health_exposes_signer_and_queue() {
        let state = test_state(1);
        let expected = state.signer_address.clone();
        let router = router(state);

        let (status, body) = call(
            router,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["signerAddress"], expected);
        assert!(body["queue"]["queued"].is_number());
        assert!(body["queue"]["running"].is_number());
    }
}
