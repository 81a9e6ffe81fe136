//! HTTP query API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/v1/{kind}/records?tags=a,b&count=N` | Newest records matching any tag |
//! | `GET`  | `/v1/{kind}/records/before?tags=a,b&cursor=ID&count=N` | Records older than `cursor` |
//! | `GET`  | `/v1/{kind}/tags` | Every known tag (cached) |
//! | `POST` | `/v1/{kind}/scrape?limit=N` | Run an ad-hoc scrape cycle |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `{kind}` is `hacking` or `transfer`; anything else is a 404.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid count: 'abc'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//! `count` above [`MAX_PAGE_SIZE`] is a `bad_request`.
//! Internal failures never echo their cause to the client; the detail is
//! logged server-side.
//!
//! The scrape endpoint answers with `{ message, processed_count, error_count }`
//! and uses 500 only when the cycle had errors and stored nothing.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use hack_timeline_core::models::{Record, RecordKind, Tag};
use hack_timeline_core::store::RecordStore;

use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::sqlite_store::SqliteStore;
use crate::tag_cache::TagCache;
use crate::traits::GatewayRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn RecordStore>,
    tag_cache: Arc<TagCache>,
    scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tag_cache: Arc<TagCache>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            store,
            tag_cache,
            scheduler,
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/{kind}/records", get(handle_latest))
        .route("/v1/{kind}/records/before", get(handle_before))
        .route("/v1/{kind}/tags", get(handle_tags))
        .route("/v1/{kind}/scrape", post(handle_scrape))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` is cancelled.
pub async fn run_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("query API listening on http://{}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// `htl serve`: run the scheduler and the query API until Ctrl-C.
pub async fn run_serve(config: &Config) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(config).await?);
    let tag_cache = Arc::new(TagCache::new(
        store.clone(),
        std::time::Duration::from_secs(config.cache.tag_ttl_secs),
    ));
    let registry = GatewayRegistry::from_config(config)?;
    info!(channels = registry.len(), "configured source channels");

    let scheduler = Arc::new(Scheduler::from_config(
        config,
        &registry,
        store.clone(),
        tag_cache.clone(),
    )?);

    let shutdown = CancellationToken::new();
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!("failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    let state = AppState::new(store, tag_cache, scheduler);
    let served = run_server(&config.server.bind, state, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("scheduler task failed: {}", e);
    }
    served
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Log `err` and return a generic 500.
fn internal(context: &str, err: anyhow::Error) -> AppError {
    error!("{}: {:#}", context, err);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "Internal Server Error".to_string(),
    }
}

// ============ Parameter parsing ============

/// Largest `count` a single records request may ask for.
pub const MAX_PAGE_SIZE: i64 = 500;

fn parse_kind(raw: &str) -> Result<RecordKind, AppError> {
    raw.parse()
        .map_err(|_| not_found(format!("unknown record kind: {}", raw)))
}

/// A required, strictly positive integer parameter.
fn parse_positive(name: &str, raw: Option<&str>) -> Result<i64, AppError> {
    let raw = raw.unwrap_or_default();
    match raw.trim().parse::<i64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(bad_request(format!("{} must be positive", name))),
        Err(_) => Err(bad_request(format!("invalid {}: '{}'", name, raw))),
    }
}

fn parse_count(raw: Option<&str>) -> Result<i64, AppError> {
    let count = parse_positive("count", raw)?;
    if count > MAX_PAGE_SIZE {
        return Err(bad_request(format!(
            "count must be at most {}",
            MAX_PAGE_SIZE
        )));
    }
    Ok(count)
}

fn split_tags(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
struct RecordsParams {
    tags: Option<String>,
    count: Option<String>,
    cursor: Option<String>,
}

// ============ GET /v1/{kind}/records ============

async fn handle_latest(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<RecordsParams>,
) -> Result<Json<Vec<Record>>, AppError> {
    let kind = parse_kind(&kind)?;
    let count = parse_count(params.count.as_deref())?;
    let tags = split_tags(params.tags.as_deref());

    let records = state
        .store
        .list_by_tags(kind, &tags, count)
        .await
        .map_err(|e| internal("failed to list records", e))?;
    Ok(Json(records))
}

// ============ GET /v1/{kind}/records/before ============

async fn handle_before(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<RecordsParams>,
) -> Result<Json<Vec<Record>>, AppError> {
    let kind = parse_kind(&kind)?;
    let raw_cursor = params.cursor.as_deref().unwrap_or_default();
    let cursor: i64 = raw_cursor
        .trim()
        .parse()
        .map_err(|_| bad_request(format!("invalid cursor: '{}'", raw_cursor)))?;
    let count = parse_count(params.count.as_deref())?;
    let tags = split_tags(params.tags.as_deref());

    let records = state
        .store
        .list_by_tags_before(kind, &tags, cursor, count)
        .await
        .map_err(|e| internal("failed to list older records", e))?;
    Ok(Json(records))
}

// ============ GET /v1/{kind}/tags ============

async fn handle_tags(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<Tag>>, AppError> {
    parse_kind(&kind)?;
    let tags = state
        .tag_cache
        .get()
        .await
        .map_err(|e| internal("failed to list tags", e))?;
    Ok(Json(tags.as_ref().clone()))
}

// ============ POST /v1/{kind}/scrape ============

#[derive(Deserialize)]
struct ScrapeParams {
    limit: Option<String>,
}

#[derive(Serialize)]
struct ScrapeResponse {
    message: String,
    processed_count: usize,
    error_count: usize,
}

async fn handle_scrape(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<ScrapeParams>,
) -> Result<(StatusCode, Json<ScrapeResponse>), AppError> {
    let kind = parse_kind(&kind)?;
    let limit = parse_positive("limit", params.limit.as_deref())?;

    let report = state
        .scheduler
        .trigger(kind, limit as usize)
        .await
        .map_err(|e| internal("scrape trigger failed", e))?;

    for err in &report.errors {
        error!(kind = %kind, "scrape error: {}", err);
    }

    let processed = report.stored;
    let failed = report.errors.len();
    let (status, message) = if failed == 0 && processed == 0 {
        (StatusCode::OK, "No new messages to process.".to_string())
    } else if failed == 0 {
        (
            StatusCode::OK,
            format!("Successfully processed {} new records.", processed),
        )
    } else if report.made_no_progress() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Scraping failed with {} errors.", failed),
        )
    } else {
        (
            StatusCode::OK,
            format!(
                "Processed {} new records with {} errors.",
                processed, failed
            ),
        )
    };

    Ok((
        status,
        Json(ScrapeResponse {
            message,
            processed_count: processed,
            error_count: failed,
        }),
    ))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
