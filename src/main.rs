use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use outline_clipper::extract::ExtractionError;
use outline_clipper::models::{
    AppendRequest, ClipRequest, ClipperOptions, ConnectionRequest, ExtractRequest, SearchRequest,
};
use outline_clipper::store::Store;
use outline_clipper::{ClipError, ClipService};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

const BIND_ENV: &str = "OUTLINE_CLIPPER_BIND";
const STORE_ENV: &str = "OUTLINE_CLIPPER_STORE";
const API_URL_ENV: &str = "OUTLINE_CLIPPER_API_URL";
const API_TOKEN_ENV: &str = "OUTLINE_CLIPPER_API_TOKEN";

type AppState = Arc<ClipService>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let store_path = env_or(STORE_ENV, "./outline-clipper.json");
    let store = Arc::new(Store::open(store_path)?);
    seed_credentials(&store)?;

    let service: AppState = Arc::new(ClipService::new(store));

    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract_endpoint))
        .route("/extract/selection", post(extract_selection_endpoint))
        .route("/clip", post(clip_endpoint))
        .route("/upload/state", get(upload_state))
        .route("/upload/stop", post(upload_stop))
        .route("/settings/test-connection", post(test_connection))
        .route("/settings/options", get(get_options).put(put_options))
        .route("/collections", get(collections))
        .route("/collections/:id/documents", get(documents))
        .route("/documents/search", post(search))
        .route("/documents/append", post(append))
        .route("/recent", get(recent))
        .with_state(service);

    let listener = tokio::net::TcpListener::bind(env_or(BIND_ENV, "0.0.0.0:8000")).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Environment credentials win over the stored ones.
fn seed_credentials(store: &Store) -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::var(API_URL_ENV).ok().filter(|v| !v.trim().is_empty());
    let token = std::env::var(API_TOKEN_ENV).ok().filter(|v| !v.trim().is_empty());
    if url.is_none() && token.is_none() {
        return Ok(());
    }
    store.update(|cfg| {
        if url.is_some() {
            cfg.api_url = url;
        }
        if token.is_some() {
            cfg.api_token = token;
        }
    })?;
    tracing::info!("credentials seeded from environment");
    Ok(())
}

// ── Replies ──────────────────────────────────────────────────────────────────

fn ok<T: Serialize>(field: &str, value: T) -> Response {
    let mut body = json!({ "success": true });
    body[field] = serde_json::to_value(value).unwrap_or(Value::Null);
    (StatusCode::OK, Json(body)).into_response()
}

fn failure(err: ClipError) -> Response {
    let status = match &err {
        ClipError::Extraction(ExtractionError::InvalidUrl(_))
        | ClipError::Extraction(ExtractionError::EmptySelection) => StatusCode::BAD_REQUEST,
        ClipError::Extraction(ExtractionError::NotHtml)
        | ClipError::Extraction(ExtractionError::NoContent) => StatusCode::UNPROCESSABLE_ENTITY,
        ClipError::Extraction(_) => StatusCode::BAD_GATEWAY,
        ClipError::Auth(_) => StatusCode::UNAUTHORIZED,
        ClipError::Config(_) => StatusCode::BAD_REQUEST,
        ClipError::RemoteApi(_) => StatusCode::BAD_GATEWAY,
        ClipError::Busy => StatusCode::CONFLICT,
        ClipError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%status, category = err.category(), error = %err, "request failed");
    (
        status,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "category": err.category(),
        })),
    )
        .into_response()
}

fn reply<T: Serialize>(field: &str, result: Result<T, ClipError>) -> Response {
    match result {
        Ok(value) => ok(field, value),
        Err(err) => failure(err),
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn extract_endpoint(State(svc): State<AppState>, Json(req): Json<ExtractRequest>) -> Response {
    reply("content", svc.extract(req).await)
}

async fn extract_selection_endpoint(
    State(svc): State<AppState>,
    Json(req): Json<ExtractRequest>,
) -> Response {
    reply("content", svc.extract_selection(req).await)
}

async fn clip_endpoint(State(svc): State<AppState>, Json(req): Json<ClipRequest>) -> Response {
    reply("result", svc.clip(req).await)
}

async fn upload_state(State(svc): State<AppState>) -> Response {
    ok("state", svc.upload_state())
}

async fn upload_stop(State(svc): State<AppState>) -> Response {
    ok("stopping", svc.request_stop())
}

async fn test_connection(
    State(svc): State<AppState>,
    body: Option<Json<ConnectionRequest>>,
) -> Response {
    reply("auth", svc.test_connection(body.map(|Json(r)| r)).await)
}

async fn get_options(State(svc): State<AppState>) -> Response {
    ok("options", svc.options())
}

async fn put_options(State(svc): State<AppState>, Json(options): Json<ClipperOptions>) -> Response {
    reply("options", svc.set_options(options))
}

async fn collections(State(svc): State<AppState>) -> Response {
    reply("collections", svc.collections().await)
}

async fn documents(State(svc): State<AppState>, Path(id): Path<String>) -> Response {
    reply("documents", svc.documents(&id).await)
}

async fn search(State(svc): State<AppState>, Json(req): Json<SearchRequest>) -> Response {
    reply("results", svc.search(req).await)
}

async fn append(State(svc): State<AppState>, Json(req): Json<AppendRequest>) -> Response {
    reply("document", svc.append(req).await)
}

async fn recent(State(svc): State<AppState>) -> Response {
    ok("recentClips", svc.recent())
}
