//! HTTP surface: thin CRUD over the manager operations.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use memory_core::{MemoryError, MessageRole, UserProfile};
use memory_manager::{MemoryManager, UserMemoryExport};

type AppState = Arc<MemoryManager>;
type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn error_response(e: MemoryError) -> ApiError {
    let status = match &e {
        MemoryError::UnknownSession(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"status": "error", "message": e.to_string()})),
    )
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"status": "error", "message": message})),
    )
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "memd"}))
}

#[derive(Deserialize)]
struct StartSessionRequest {
    user_id: String,
}

// POST /session/start
async fn start_session(
    State(manager): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult {
    let session = manager
        .start_session(&request.user_id, &CancellationToken::new())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "session_id": session.id,
        "user_id": session.user_id,
    })))
}

#[derive(Deserialize)]
struct AddMessageRequest {
    session_id: Uuid,
    role: MessageRole,
    text: String,
}

// POST /session/message
async fn add_message(
    State(manager): State<AppState>,
    Json(request): Json<AddMessageRequest>,
) -> ApiResult {
    manager
        .add_message(
            request.session_id,
            request.role,
            &request.text,
            &CancellationToken::new(),
        )
        .await
        .map_err(error_response)?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
struct EndSessionRequest {
    session_id: Uuid,
}

// POST /session/end
async fn end_session(
    State(manager): State<AppState>,
    Json(request): Json<EndSessionRequest>,
) -> ApiResult {
    let episode = manager
        .end_session(request.session_id, &CancellationToken::new())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "episode": episode })))
}

#[derive(Deserialize)]
struct ContextRequest {
    session_id: Uuid,
    query: Option<String>,
}

// POST /context
async fn get_context(
    State(manager): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> ApiResult {
    let context = manager
        .get_memory_context(
            request.session_id,
            request.query.as_deref(),
            &CancellationToken::new(),
        )
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "prompt": context.to_system_prompt(),
        "profile": context.profile,
        "facts": context.facts,
        "episodes": context.episodes,
    })))
}

// GET /profile/{user_id}
async fn get_profile(State(manager): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let profile = manager
        .get_profile(&user_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found("profile not found"))?;
    Ok(Json(json!(profile)))
}

// PUT /profile (full replace, tag cap enforced)
async fn put_profile(
    State(manager): State<AppState>,
    Json(profile): Json<UserProfile>,
) -> ApiResult {
    manager.put_profile(profile).await.map_err(error_response)?;
    Ok(Json(json!({})))
}

// GET /stats/{user_id}
async fn get_stats(State(manager): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let stats = manager.stats(&user_id).await.map_err(error_response)?;
    Ok(Json(json!(stats)))
}

// GET /export/{user_id}
async fn export_user(State(manager): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let export = manager.export_user(&user_id).await.map_err(error_response)?;
    Ok(Json(json!(export)))
}

// POST /import
async fn import_user(
    State(manager): State<AppState>,
    Json(payload): Json<UserMemoryExport>,
) -> ApiResult {
    manager.import_user(&payload).await.map_err(error_response)?;
    Ok(Json(json!({})))
}

// POST /maintenance/forget/{user_id}
async fn forget_user(State(manager): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let removed = manager.run_forget(&user_id).await.map_err(error_response)?;
    Ok(Json(json!({ "removed_n": removed })))
}

// POST /maintenance/cleanup
async fn cleanup(State(manager): State<AppState>) -> ApiResult {
    let removed = manager.cleanup().await.map_err(error_response)?;
    Ok(Json(json!({ "removed_n": removed })))
}

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session/start", post(start_session))
        .route("/session/message", post(add_message))
        .route("/session/end", post(end_session))
        .route("/context", post(get_context))
        .route("/profile/{user_id}", get(get_profile))
        .route("/profile", put(put_profile))
        .route("/stats/{user_id}", get(get_stats))
        .route("/export/{user_id}", get(export_user))
        .route("/import", post(import_user))
        .route("/maintenance/forget/{user_id}", post(forget_user))
        .route("/maintenance/cleanup", post(cleanup))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

pub async fn serve(manager: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = addr, "memd listening");
    axum::serve(listener, router(manager)).await?;
    Ok(())
}
