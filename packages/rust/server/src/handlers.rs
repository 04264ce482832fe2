//! Request handlers for the operator API.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use inboxmirror_core::{CrawlRequest, INBOX_JOB_KEY, JobStatus};
use inboxmirror_shared::{MessageRecord, MirrorError, TargetId, TargetRecord, TargetStatus};
use inboxmirror_storage::TargetFilter;

use crate::AppState;

const MAX_PAGE_SIZE: u32 = 100;

// --- Errors ---

/// Maps [`MirrorError`] onto a status code and a JSON `{error}` body.
pub struct ApiError(MirrorError);

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MirrorError::NotFound(_) => StatusCode::NOT_FOUND,
            MirrorError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Query and body structs ---

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    /// Comma-separated statuses to leave out.
    exclude_status: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct StatusBody {
    status: String,
}

#[derive(Deserialize)]
pub struct CrawlQuery {
    locator: Option<String>,
}

#[derive(Serialize)]
pub struct PageMeta {
    current_page: u32,
    total_pages: u64,
    total_items: u64,
    limit: u32,
    has_next: bool,
    has_prev: bool,
}

#[derive(Serialize)]
pub struct TargetList {
    data: Vec<TargetRecord>,
    meta: PageMeta,
}

#[derive(Serialize)]
pub struct CrawlStarted {
    target_key: String,
    phase: inboxmirror_shared::JobPhase,
    message: &'static str,
}

#[derive(Serialize)]
pub struct CrawlStatus {
    #[serde(flatten)]
    status: JobStatus,
    /// The job has been running past the caller-side give-up threshold.
    abandoned: bool,
}

// --- Helpers ---

fn parse_status_list(raw: &str) -> ApiResult<Vec<TargetStatus>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TargetStatus>().map_err(ApiError::from))
        .collect()
}

/// Find a target by local id, falling back to the source's conversation id.
async fn lookup(state: &AppState, key: &str) -> ApiResult<TargetRecord> {
    let storage = state.service.storage();
    if let Ok(id) = key.parse::<TargetId>() {
        if let Some(record) = storage.get_target(&id).await? {
            return Ok(record);
        }
    }
    storage
        .find_by_external_key(key)
        .await?
        .ok_or_else(|| MirrorError::NotFound(format!("target {key}")).into())
}

// --- Handlers ---

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_targets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<TargetList>> {
    let filter = TargetFilter {
        status: query.status.as_deref().map(str::parse::<TargetStatus>).transpose()?,
        exclude_status: match query.exclude_status.as_deref() {
            Some(raw) => parse_status_list(raw)?,
            None => Vec::new(),
        },
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
    };

    let page = state.service.storage().list_targets(&filter).await?;
    let total_pages = page.total.div_ceil(u64::from(filter.limit));
    let meta = PageMeta {
        current_page: filter.page,
        total_pages,
        total_items: page.total,
        limit: filter.limit,
        has_next: u64::from(filter.page) < total_pages,
        has_prev: filter.page > 1,
    };
    Ok(Json(TargetList {
        data: page.items,
        meta,
    }))
}

pub async fn get_target(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<TargetRecord>> {
    Ok(Json(lookup(&state, &key).await?))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<MessageRecord>>> {
    let record = lookup(&state, &key).await?;
    Ok(Json(state.service.storage().list_messages(&record.id).await?))
}

pub async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Json<TargetRecord>> {
    let status: TargetStatus = body.status.parse()?;
    let record = lookup(&state, &key).await?;
    let storage = state.service.storage();
    storage.set_status(&record.id, status).await?;
    info!(target_id = %record.id, %status, "operator changed status");

    let updated = storage
        .get_target(&record.id)
        .await?
        .ok_or_else(|| MirrorError::NotFound(format!("target {key}")))?;
    Ok(Json(updated))
}

pub async fn clear_unread(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<TargetRecord>> {
    let record = lookup(&state, &key).await?;
    let storage = state.service.storage();
    storage.clear_unread(&record.id).await?;

    let updated = storage
        .get_target(&record.id)
        .await?
        .ok_or_else(|| MirrorError::NotFound(format!("target {key}")))?;
    Ok(Json(updated))
}

/// Start a crawl and return without waiting for it.
pub async fn start_crawl(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<CrawlQuery>,
) -> impl IntoResponse {
    let request = CrawlRequest {
        target_key: key.clone(),
        locator: query.locator.filter(|l| !l.trim().is_empty()),
    };
    // The handle is dropped; pollers use the tracker.
    let _ = state.service.start(request);
    let status = state.service.tracker().read(&key);

    (
        StatusCode::ACCEPTED,
        Json(CrawlStarted {
            target_key: key,
            phase: status.stored_phase,
            message: "crawl started",
        }),
    )
}

pub async fn crawl_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<CrawlStatus> {
    Json(job_status(&state, &key))
}

/// Start an inbox sync and return without waiting for it.
pub async fn start_sync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = state.service.start_sync();
    let status = state.service.tracker().read(INBOX_JOB_KEY);

    (
        StatusCode::ACCEPTED,
        Json(CrawlStarted {
            target_key: INBOX_JOB_KEY.to_string(),
            phase: status.stored_phase,
            message: "inbox sync started",
        }),
    )
}

pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<CrawlStatus> {
    Json(job_status(&state, INBOX_JOB_KEY))
}

fn job_status(state: &AppState, key: &str) -> CrawlStatus {
    let tracker = state.service.tracker();
    CrawlStatus {
        status: tracker.read(key),
        abandoned: tracker.is_abandoned(key),
    }
}
