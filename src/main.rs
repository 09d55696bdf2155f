mod classifier;
mod config;
mod criteria;
mod http;
mod idempotency;
mod ingest;
mod jobs;
mod listing;
mod llm;
mod matching;
mod merge;
mod metrics;
mod models;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use config::env_parse;
use eyre::WrapErr;
use ingest::{FatalRunError, Ingestor, RunRequest, RunSummary};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, EnqueueResponse, IngestJobRequest, IngestRequest};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(err) = run().await {
        error!(target = "buybox.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let shutdown = CancellationToken::new();
    let ingestor = Ingestor::from_env()
        .await
        .wrap_err("failed to open property store")?;
    let (queue, worker) = jobs::JobQueue::spawn(ingestor.clone(), shutdown.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let idempotency_ttl_secs = env_parse::<u64>("IDEMPOTENCY_TTL_SECS").unwrap_or(3600);

    let state = AppState {
        ingestor,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: Arc::new(idempotency::ReplayCache::new(Duration::from_secs(
            idempotency_ttl_secs,
        ))),
        idempotency_ttl_secs,
        prometheus_handle,
        redis,
        shutdown: shutdown.clone(),
    };
    let app = build_app(state, AuthState::from_env());

    let port: u16 = env_parse("PORT").unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "buybox.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    worker.abort();
    Ok(())
}

/// Resolves on Ctrl-C after cancelling every in-flight run.
async fn shutdown_signal(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target = "buybox.api", "shutdown requested; cancelling runs");
    }
    shutdown.cancel();
}

#[derive(Clone)]
struct AppState {
    ingestor: Ingestor,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<idempotency::ReplayCache>,
    idempotency_ttl_secs: u64,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
    shutdown: CancellationToken,
}

fn build_app(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/buy-boxes/{id}/ingest", post(ingest_buy_box))
        .nest(
            "/jobs",
            Router::new()
                .route("/ingest", post(enqueue_ingest_job))
                .route("/{id}", get(get_job_status))
                .route("/{id}/cancel", post(cancel_job)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "buybox-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Buy Box API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

fn body_limit_from_env() -> usize {
    env_parse::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(8 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Run one feed against one Buy Box and wait for the summary.
///
/// - Method: `POST`
/// - Path: `/buy-boxes/{id}/ingest`
/// - Auth: `Authorization: Bearer <key>` or `X-Api-Key: <key>`
/// - Body: `IngestRequest`
/// - Response: `RunSummary`
///
/// A repeated `Idempotency-Key` replays the first summary instead of
/// running again.
async fn ingest_buy_box(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<RunSummary>, AppError> {
    crate::metrics::inc_requests("/buy-boxes/{id}/ingest");
    let buy_box_id = parse_id(&id, "invalid_buy_box_id")?;
    let Json(payload) = payload?;
    info!(
        target = "buybox.api",
        company_id = %context.company_id,
        api_key = %context.api_key_id,
        buy_box_id = %buy_box_id,
        items = payload.feed.len(),
        "ingestion invoked",
    );
    let request = RunRequest {
        company_id: context.company_id,
        buy_box_id,
        feed: payload.feed,
        dry_run: payload.dry_run,
    };

    let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return Ok(Json(run_now(&state, request).await?));
    };
    let key = idempotency::scoped_key(context.company_id, &key);

    if let Some(client) = &state.redis {
        if let Some(existing) = idempotency::redis_get(client, &key).await {
            return Ok(Json(existing));
        }
        let summary = run_now(&state, request).await?;
        idempotency::redis_set(client, &key, &summary, state.idempotency_ttl_secs).await;
        return Ok(Json(summary));
    }
    if let Some(existing) = state.idempotency.get(&key).await {
        return Ok(Json(existing));
    }
    let summary = run_now(&state, request).await?;
    state.idempotency.insert(key, summary.clone()).await;
    Ok(Json(summary))
}

async fn run_now(state: &AppState, request: RunRequest) -> Result<RunSummary, AppError> {
    Ok(state
        .ingestor
        .run(request, state.shutdown.child_token())
        .await?)
}

async fn enqueue_ingest_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<IngestJobRequest>, JsonRejection>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/ingest");
    let Json(payload) = payload?;
    let id = state
        .queue
        .enqueue_ingest(RunRequest {
            company_id: context.company_id,
            buy_box_id: payload.buy_box_id,
            feed: payload.feed,
            dry_run: payload.dry_run,
        })
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let id = parse_id(&id, "invalid_job_id")?;
    state
        .queue
        .get(id, &context)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(ApiError::new("not_found", format!("job {id}"))))
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id, "invalid_job_id")?;
    if state.queue.cancel(id, &context).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::NotFound(ApiError::new(
            "not_found",
            format!("job {id}"),
        )))
    }
}

fn parse_id(raw: &str, code: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|err| AppError::BadRequest(ApiError::new(code, err.to_string())))
}

#[derive(Debug)]
enum AppError {
    Run(FatalRunError),
    BadRequest(ApiError),
    NotFound(ApiError),
    Unauthorized,
    Internal(ApiError),
}

impl From<FatalRunError> for AppError {
    fn from(value: FatalRunError) -> Self {
        Self::Run(value)
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::BadRequest(ApiError::new("invalid_body", value.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Run(err) => {
                let status = match &err {
                    FatalRunError::UnknownBuyBox(_) => StatusCode::NOT_FOUND,
                    FatalRunError::InvalidCriteria(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    FatalRunError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    FatalRunError::FeedTooLarge { .. } => StatusCode::BAD_REQUEST,
                };
                (status, ApiError::new(err.code(), err.to_string()))
            }
            AppError::BadRequest(payload) => (StatusCode::BAD_REQUEST, payload),
            AppError::NotFound(payload) => (StatusCode::NOT_FOUND, payload),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError::new("unauthorized", "missing or wrong docs key"),
            ),
            AppError::Internal(payload) => (StatusCode::INTERNAL_SERVER_ERROR, payload),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
