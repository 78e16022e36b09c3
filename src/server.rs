//! HTTP API for the consolidation service.
//!
//! Thin boundary over [`Consolidator`]: parses and normalizes the identify
//! payload, checks the bearer token, and maps engine errors to statuses.
//! All identity logic lives in [`crate::consolidate`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::auth::{self, AuthError};
use crate::clog;
use crate::consolidate::{ConsolidateError, Consolidator, Submission};
use crate::store::SqliteStore;

const MIN_PASSWORD_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub consolidator: Consolidator<SqliteStore>,
    /// When false, `/auth/signup` is closed and returns 403.
    pub open_signup: bool,
}

/// One store handle behind one lock: requests are serialized process-wide.
/// Disjoint-group submits could run in parallel over per-worker
/// `SqliteStore` handles, which the store layer already supports; a single
/// serving process keeps the boundary to one handle for simplicity.
pub type SharedState = Arc<Mutex<AppState>>;

/// Build the service router.
pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identify", post(identify))
        .route("/auth/signup", post(signup))
        .route("/auth/signin", post(signin))
        .route("/auth/logout", post(logout))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdentifyRequest {
    #[serde(default)]
    email: Option<String>,
    /// Accepted as a JSON string or number; clients routinely send both.
    #[serde(rename = "phoneNumber", default)]
    phone_number: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
}

fn phone_to_string(value: Option<Value>) -> Result<Option<String>, Response> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("phoneNumber must be a string or number, got {other}") })),
        )
            .into_response()),
    }
}

// ---------------------------------------------------------------------------
// Auth plumbing
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response());
    };
    match auth::authenticate(state.consolidator.store(), token) {
        Ok(_) => Ok(()),
        Err(AuthError::InvalidCredentials) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or expired token" })),
        )
            .into_response()),
        Err(e) => {
            clog!("auth: token check failed: {e}");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "store unavailable" })),
            )
                .into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn identify(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<IdentifyRequest>,
) -> Response {
    let state = state.lock().await;
    if let Err(response) = require_auth(&state, &headers) {
        return response;
    }
    let phone = match phone_to_string(req.phone_number) {
        Ok(phone) => phone,
        Err(response) => return response,
    };
    let submission = Submission::new(req.email, phone);
    match state.consolidator.submit(&submission) {
        Ok(view) => (StatusCode::OK, Json(json!({ "contact": view }))).into_response(),
        Err(e) => consolidate_error_response(e),
    }
}

fn consolidate_error_response(e: ConsolidateError) -> Response {
    match e {
        ConsolidateError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
        }
        ConsolidateError::NotFound(msg) => {
            // Broken linkage is an invariant violation, not a user error.
            clog!("identify: consistency error: {msg}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal consistency error" })),
            )
                .into_response()
        }
        ConsolidateError::Conflict(msg) | ConsolidateError::Unavailable(msg) => {
            clog!("identify: transient failure: {msg}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "temporarily unavailable, retry later" })),
            )
                .into_response()
        }
    }
}

async fn signup(
    State(state): State<SharedState>,
    Json(req): Json<CredentialsRequest>,
) -> Response {
    let state = state.lock().await;
    if !state.open_signup {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "signup is closed" })),
        )
            .into_response();
    }
    if req.username.trim().is_empty() || req.password.len() < MIN_PASSWORD_LEN {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "username must be non-empty and password at least {MIN_PASSWORD_LEN} characters"
                )
            })),
        )
            .into_response();
    }
    match auth::signup(state.consolidator.store(), req.username.trim(), &req.password) {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "id": id, "status": "registered" })),
        )
            .into_response(),
        Err(AuthError::UsernameTaken(_)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "username already taken" })),
        )
            .into_response(),
        Err(e) => {
            clog!("auth: signup failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "store unavailable" })),
            )
                .into_response()
        }
    }
}

async fn signin(
    State(state): State<SharedState>,
    Json(req): Json<CredentialsRequest>,
) -> Response {
    let state = state.lock().await;
    match auth::signin(state.consolidator.store(), req.username.trim(), &req.password) {
        Ok(token) => (StatusCode::OK, Json(json!({ "token": token }))).into_response(),
        Err(AuthError::InvalidCredentials) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid username or password" })),
        )
            .into_response(),
        Err(e) => {
            clog!("auth: signin failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "store unavailable" })),
            )
                .into_response()
        }
    }
}

async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let state = state.lock().await;
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };
    match auth::logout(state.consolidator.store(), token) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "logged out" }))).into_response(),
        Err(e) => {
            clog!("auth: logout failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "store unavailable" })),
            )
                .into_response()
        }
    }
}
