pub mod error;
pub mod ratelimit;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRef, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, patch, post};
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use auth::{Auth, AuthConfig};
use error::ApiError;
use ratelimit::{RateLimitConfig, RateLimitLayer, RateLimiter};
use storage::{StorageBackend, TraceListFilter};
use trace::dto::{
    ErrorResponse, HealthResponse, SpanActionResponse, SpanCompleteRequest, SpanCreate,
    StatsResponse, TraceActionResponse, TraceCompleteRequest, TraceCreate, TraceDetailResponse,
    TraceListQuery, TraceListResponse,
};

pub use error::ApiError as Error;

/// Shared application state, handed to every handler via axum's `State`
/// extractor. `backend` is `dyn`-erased so the `daemon` crate can swap in a
/// concrete `storage-sqlite::SqliteBackend` (or, in tests, an in-memory one)
/// without this crate depending on the concrete type.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn StorageBackend>,
    pub auth_config: Arc<AuthConfig>,
    pub start_time: Instant,
    /// Updated by the daemon's TTL-sweep task after each pass; surfaced on
    /// `/health` so an operator can see the sweep is still running.
    pub last_sweep: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl FromRef<AppState> for Arc<AuthConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.auth_config.clone()
    }
}

// axum's `FromRequestParts` bound for `auth::Auth` requires `AuthConfig:
// FromRef<S>` directly (not `Arc<AuthConfig>`) — see `auth::middleware`.
impl FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        (*state.auth_config).clone()
    }
}

// --- Trace handlers ---

async fn create_trace(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Json(req): Json<TraceCreate>,
) -> Result<(StatusCode, Json<TraceActionResponse>), ApiError> {
    if req.project_id != ctx.project_id {
        return Err(ApiError::Forbidden);
    }
    let trace = req.into_trace()?;
    let trace_id = trace.id;
    state.backend.save_trace(&trace).await?;
    tracing::info!(trace_id = %trace_id, project_id = %ctx.project_id, "trace created");
    Ok((
        StatusCode::OK,
        Json(TraceActionResponse { trace_id, status: "created" }),
    ))
}

async fn create_span(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(trace_id): Path<Uuid>,
    Json(req): Json<SpanCreate>,
) -> Result<(StatusCode, Json<SpanActionResponse>), ApiError> {
    state
        .backend
        .get_trace(trace_id, Some(&ctx.project_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    let span = req.into_span(trace_id)?;
    let span_id = span.id;
    state.backend.save_span(&span).await?;
    tracing::info!(span_id = %span_id, trace_id = %trace_id, "span created");
    Ok((
        StatusCode::OK,
        Json(SpanActionResponse { span_id, status: "created" }),
    ))
}

async fn complete_span(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(span_id): Path<Uuid>,
    Json(req): Json<SpanCompleteRequest>,
) -> Result<Json<SpanActionResponse>, ApiError> {
    req.validate()?;
    let span = state.backend.get_span(span_id).await?.ok_or(ApiError::NotFound)?;
    state
        .backend
        .get_trace(span.trace_id, Some(&ctx.project_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    let completed = state.backend.complete_span(span_id, req).await?;
    if !completed {
        return Err(ApiError::NotFound);
    }
    tracing::debug!(span_id = %span_id, "span completed");
    Ok(Json(SpanActionResponse { span_id, status: "completed" }))
}

async fn complete_trace(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(trace_id): Path<Uuid>,
    Json(req): Json<TraceCompleteRequest>,
) -> Result<Json<TraceActionResponse>, ApiError> {
    state
        .backend
        .get_trace(trace_id, Some(&ctx.project_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    let completed = state.backend.complete_trace(trace_id, req).await?;
    if !completed {
        return Err(ApiError::NotFound);
    }
    tracing::debug!(trace_id = %trace_id, "trace completed");
    Ok(Json(TraceActionResponse { trace_id, status: "completed" }))
}

async fn list_traces(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Query(query): Query<TraceListQuery>,
) -> Result<Json<TraceListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let filter = TraceListFilter {
        user_id: query.user_id,
        session_id: query.session_id,
        tags: query
            .tags
            .map(|csv| csv.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default(),
    };

    let page = state
        .backend
        .list_traces(&ctx.project_id, limit, query.cursor.as_deref(), &filter)
        .await?;

    let next_cursor = page.last_key.as_ref().map(storage::cursor::encode);
    let has_more = page.last_key.is_some();
    let count = page.traces.len();
    Ok(Json(TraceListResponse { traces: page.traces, next_cursor, has_more, count }))
}

async fn get_trace(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(trace_id): Path<Uuid>,
) -> Result<Json<TraceDetailResponse>, ApiError> {
    let trace = state
        .backend
        .get_trace(trace_id, Some(&ctx.project_id))
        .await?
        .ok_or(ApiError::NotFound)?;
    let spans = state.backend.get_spans(trace_id).await?;
    let span_count = spans.len();
    Ok(Json(TraceDetailResponse { trace, spans, span_count }))
}

async fn get_stats(
    State(state): State<AppState>,
    Auth(ctx): Auth,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.backend.stats(&ctx.project_id).await?;
    Ok(Json(stats))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let last_sweep = *state.last_sweep.read().await;
    Json(HealthResponse {
        status: "healthy",
        storage: state.backend.backend_name(),
        timestamp: Utc::now(),
        last_sweep,
    })
}

async fn not_found() -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("not found")))
}

// --- Router ---

/// Builds the router and applies middleware in the order spec.md §4.3
/// mandates: rate limiting runs ahead of authorization (SPEC_FULL.md §9
/// Open Question 1), then CORS, following the teacher's layering pattern of
/// innermost-route-first, outermost-concern-last.
pub struct RouterBuilder {
    state: AppState,
    rate_limit: RateLimitConfig,
    cors_origins: Vec<String>,
}

impl RouterBuilder {
    pub fn new(backend: Arc<dyn StorageBackend>, auth_config: AuthConfig) -> Self {
        Self {
            state: AppState {
                backend,
                auth_config: Arc::new(auth_config),
                start_time: Instant::now(),
                last_sweep: Arc::new(RwLock::new(None)),
            },
            rate_limit: RateLimitConfig::default(),
            cors_origins: vec!["*".to_string()],
        }
    }

    /// Handle to the sweep timestamp, so the daemon's TTL-sweep task can
    /// update it after each pass without reaching into route internals.
    pub fn last_sweep_handle(&self) -> Arc<RwLock<Option<DateTime<Utc>>>> {
        self.state.last_sweep.clone()
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn build(self) -> Router {
        let cors = if self.cors_origins.iter().any(|o| o == "*") {
            CorsLayer::permissive()
        } else {
            let origins = self
                .cors_origins
                .iter()
                .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
                .collect::<Vec<_>>();
            CorsLayer::new().allow_origin(origins)
        };

        let api = Router::new()
            .route("/traces", post(create_trace).get(list_traces))
            .route("/traces/:trace_id", get(get_trace))
            .route("/traces/:trace_id/complete", patch(complete_trace))
            .route("/traces/:trace_id/spans", post(create_span))
            .route("/spans/:span_id/complete", patch(complete_span))
            .route("/stats", get(get_stats));

        Router::new()
            .nest("/api", api)
            .route("/health", get(health))
            .fallback(not_found)
            .layer(cors)
            .layer(RateLimitLayer::new(RateLimiter::new(self.rate_limit)))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }
}

pub async fn serve_with_shutdown(
    router: Router,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
