mod batching;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod notify;
mod pipeline;
mod prompt;
mod resolver;
mod supabase;
mod validate;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, AutoCaptionRequest, AutoCaptionResponse, CombinedCaptionRequest,
    CombinedCaptionResponse, RunAllRequest, RunAllResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "calliope.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(idempotency::MemoryCache::from_env())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/captions/auto", post(auto_captions))
        .route("/captions/combined", post(combined_caption))
        .route("/runs", post(run_all_organizations))
        .nest(
            "/jobs",
            Router::new()
                .route("/captions", post(enqueue_caption_job))
                .route("/{id}", get(get_job_status)),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "calliope.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<idempotency::MemoryCache>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "calliope-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Calliope API Docs</title>
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
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

// Five inline images at the 5MB decoded cap are ~35MB of base64 plus JSON
// framing, so the default must sit above that.
const DEFAULT_BODY_LIMIT: usize = 48 * 1024 * 1024;

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_BODY_LIMIT)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run auto-selection captioning for one organization.
///
/// - Method: `POST`
/// - Path: `/captions/auto`
/// - Body: `AutoCaptionRequest` (inline messages, or a fetch window)
/// - Response: `AutoCaptionResponse` (at most five posts)
async fn auto_captions(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<AutoCaptionRequest>,
) -> Result<Json<AutoCaptionResponse>, AppError> {
    crate::metrics::inc_requests("/captions/auto");
    info!(
        target = "calliope.api",
        org_id = %payload.org_id,
        "auto-selection pipeline invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = run_auto(&state, payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key) {
            return Ok(Json(existing));
        }
        let response = run_auto(&state, payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = run_auto(&state, payload).await?;
    Ok(Json(response))
}

async fn run_auto(
    state: &AppState,
    payload: AutoCaptionRequest,
) -> Result<AutoCaptionResponse, AppError> {
    let org_id = payload.org_id.clone();
    let posts = state.pipeline.run_auto_request(&payload).await?;
    Ok(AutoCaptionResponse { org_id, posts })
}

/// Generate one caption across a user-curated set of at most five images.
///
/// - Method: `POST`
/// - Path: `/captions/combined`
async fn combined_caption(
    State(state): State<AppState>,
    Json(payload): Json<CombinedCaptionRequest>,
) -> Result<Json<CombinedCaptionResponse>, AppError> {
    crate::metrics::inc_requests("/captions/combined");
    let post = state.pipeline.run_combined(&payload.images).await?;
    Ok(Json(CombinedCaptionResponse { post }))
}

/// Sweep every organization for a time window: fetch, caption, persist,
/// notify. Per-org failures land in the report, not in the HTTP status.
///
/// - Method: `POST`
/// - Path: `/runs`
async fn run_all_organizations(
    State(state): State<AppState>,
    Json(payload): Json<RunAllRequest>,
) -> Result<Json<RunAllResponse>, AppError> {
    crate::metrics::inc_requests("/runs");
    let organizations = state
        .pipeline
        .run_all_organizations(payload.start_time, payload.end_time)
        .await?;
    Ok(Json(RunAllResponse { organizations }))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_caption_job(
    State(state): State<AppState>,
    Json(payload): Json<AutoCaptionRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/captions");
    let id = state
        .queue
        .enqueue_captions(payload)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "not_found",
        )))
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Schema | PipelineErrorKind::Upstream => {
                        StatusCode::BAD_GATEWAY
                    }
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
