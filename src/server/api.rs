//! HTTP admin and job API

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::client::StreetViewClient;
use crate::core::config::{load_keys_from_env, FetcherConfig};
use crate::core::errors::FetchError;
use crate::core::key_pool::KeyPool;
use crate::core::models::{BatchItem, BatchOutcome, BatchProgress, BatchReport, Heading, PoolStatus};
use crate::core::storage::LocalImageStore;
use crate::processors::batch::{BatchOptions, BatchOrchestrator};

/// Finished jobs kept for status queries; older ones are dropped
const MAX_FINISHED_JOBS: usize = 100;

/// Application state
pub struct AppState {
    client: StreetViewClient,
    store: Arc<LocalImageStore>,
    jobs: Mutex<HashMap<u64, JobEntry>>,
    next_job_id: AtomicU64,
}

impl AppState {
    pub fn new(client: StreetViewClient, store: Arc<LocalImageStore>) -> Self {
        Self {
            client,
            store,
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
        }
    }

    fn key_pool(&self) -> &KeyPool {
        self.client.key_pool()
    }

    fn job_status(&self, id: u64) -> Option<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&id).map(|job| job.status(id))
    }

    fn insert_job(&self, id: u64, entry: JobEntry) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(id, entry);
        prune_finished(&mut jobs);
    }

    fn finish_job(&self, id: u64, report: BatchReport) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            job.progress = report.progress;
            job.outcome = Some(report.outcome);
        }
        prune_finished(&mut jobs);
    }
}

/// Drop the oldest finished jobs beyond `MAX_FINISHED_JOBS`
fn prune_finished(jobs: &mut HashMap<u64, JobEntry>) {
    let mut finished = jobs
        .iter()
        .filter(|(_, job)| job.outcome.is_some())
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();
    if finished.len() <= MAX_FINISHED_JOBS {
        return;
    }

    finished.sort_unstable();
    let excess = finished.len() - MAX_FINISHED_JOBS;
    for id in &finished[..excess] {
        jobs.remove(id);
    }
    debug!("Dropped {} finished jobs", excess);
}

struct JobEntry {
    progress: BatchProgress,
    outcome: Option<BatchOutcome>,
    cancel: CancellationToken,
}

impl JobEntry {
    fn status(&self, id: u64) -> JobStatus {
        JobStatus {
            id,
            state: self
                .outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "running".to_string()),
            progress: self.progress,
        }
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub prefix: String,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub reset: bool,
}

#[derive(Deserialize)]
pub struct ReloadRequest {
    pub keys: Vec<String>,
}

#[derive(Deserialize)]
pub struct JobRequest {
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub skip_existing: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub id: u64,
    pub state: String,
    pub progress: BatchProgress,
}

#[derive(Deserialize)]
pub struct FetchParams {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: Option<u16>,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Error carrying its HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let (status, code) = match &err {
            FetchError::NoImageryAvailable => (StatusCode::NOT_FOUND, "no_imagery"),
            FetchError::AllKeysExhausted => (StatusCode::SERVICE_UNAVAILABLE, "keys_exhausted"),
            FetchError::AccessDenied { .. } => (StatusCode::BAD_GATEWAY, "access_denied"),
            FetchError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::BAD_GATEWAY, "fetch_error"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.message,
                code: Some(self.code.to_string()),
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check handler
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn key_status(State(state): State<Arc<AppState>>) -> axum::Json<PoolStatus> {
    axum::Json(state.key_pool().status().await)
}

async fn reset_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResetRequest>,
) -> axum::Json<ResetResponse> {
    let reset = state.key_pool().force_reset(&payload.prefix).await;
    axum::Json(ResetResponse { reset })
}

/// Reload from the body's key list, or from the environment when the body is empty
async fn reload_keys(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<axum::Json<PoolStatus>> {
    let keys = if body.iter().all(u8::is_ascii_whitespace) {
        load_keys_from_env()
    } else {
        serde_json::from_slice::<ReloadRequest>(&body)
            .map_err(|e| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    format!("invalid reload body: {}", e),
                )
            })?
            .keys
    };

    if keys.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "no API keys supplied or configured",
        ));
    }

    state.key_pool().reload(keys).await;
    Ok(axum::Json(state.key_pool().status().await))
}

async fn start_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JobRequest>,
) -> ApiResult<(StatusCode, axum::Json<JobStatus>)> {
    if payload.items.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "items cannot be empty",
        ));
    }

    let id = state.next_job_id.fetch_add(1, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let entry = JobEntry {
        progress: BatchProgress {
            total: payload.items.len(),
            ..Default::default()
        },
        outcome: None,
        cancel: cancel.clone(),
    };
    let status = entry.status(id);
    state.insert_job(id, entry);

    let options = BatchOptions {
        skip_existing: payload.skip_existing.unwrap_or(true),
    };
    let orchestrator = BatchOrchestrator::new(state.client.clone(), state.store.clone(), options);
    let items = payload.items;
    let job_state = state.clone();

    info!("Starting job {} with {} items", id, items.len());

    tokio::spawn(async move {
        let progress_state = job_state.clone();
        let report = orchestrator
            .run(&items, &cancel, move |progress| {
                let mut jobs = progress_state.jobs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = jobs.get_mut(&id) {
                    job.progress = *progress;
                }
            })
            .await;

        job_state.finish_job(id, report);
    });

    Ok((StatusCode::ACCEPTED, axum::Json(status)))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<axum::Json<JobStatus>> {
    state
        .job_status(id)
        .map(axum::Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("job {} not found", id)))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<axum::Json<JobStatus>> {
    {
        let jobs = state.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(&id) {
            Some(job) => job.cancel.cancel(),
            None => {
                return Err(ApiError::new(
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("job {} not found", id),
                ))
            }
        }
    }

    info!("Cancellation requested for job {}", id);
    get_job(State(state), Path(id)).await
}

async fn fetch_image(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FetchParams>,
) -> ApiResult<Response> {
    let heading = Heading(params.heading.unwrap_or(0));
    let image = state
        .client
        .fetch_heading(params.lat, params.lng, heading)
        .await
        .map_err(|e| {
            if !e.is_unavailable() {
                warn!("Ad hoc fetch at {},{} failed: {}", params.lat, params.lng, e);
            }
            ApiError::from(e)
        })?;

    let mut response = (
        [(header::CONTENT_TYPE, "image/jpeg".to_string())],
        image.bytes,
    )
        .into_response();

    if let Some(date) = image.capture_date {
        if let Ok(value) = date.parse() {
            response.headers_mut().insert("x-capture-date", value);
        }
    }

    Ok(response)
}

/// Build the router over shared state
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/admin/keys", get(key_status))
        .route("/admin/keys/reset", post(reset_key))
        .route("/admin/keys/reload", post(reload_keys))
        .route("/jobs", post(start_job))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/fetch", get(fetch_image))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: FetcherConfig, host: String, port: u16) -> anyhow::Result<()> {
    config.validate()?;

    let key_pool = KeyPool::from_config(&config);
    let mut store = LocalImageStore::new(config.storage_root.clone());
    if let Some(base_url) = &config.storage_base_url {
        store = store.with_base_url(base_url.clone());
    }
    let client = StreetViewClient::new(config, key_pool)?;

    // Create app state
    let state = Arc::new(AppState::new(client, Arc::new(store)));
    let app = router(state);

    // Bind address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
