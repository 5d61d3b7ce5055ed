//! HTTP surface: code retrieval and key administration.
//!
//! | Method | Path | Body | Reply |
//! |--------|------|------|-------|
//! | `POST` | `/get-code` | `{"key": "..."}` | `{"code"}` or `{"message"}` |
//! | `POST` | `/admin/create-key` | `{"durationMinutes": 30}` (optional) | the new key |
//! | `GET` | `/admin/keys` | | every key, newest first |
//! | `DELETE` | `/admin/delete/:id` | | `{"message"}` |
//! | `GET` | `/health` | | `{"status", "mailboxConnected"}` |
//!
//! Admin routes require the `x-admin-secret` header and are disabled when no
//! secret is configured.

use crate::error::Error;
use crate::gate::OtpGate;
use crate::key_store::KeyId;
use crate::mailbox::MailStore;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

/// Header carrying the admin secret.
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Shared state of every handler.
pub struct AppState<M: MailStore> {
    /// The retrieval gate.
    pub gate: Arc<OtpGate<M>>,
    /// Secret unlocking the admin routes.
    pub admin_secret: Option<SecretString>,
}

impl<M: MailStore> AppState<M> {
    /// Creates the state.
    pub fn new(gate: OtpGate<M>, admin_secret: Option<SecretString>) -> Self {
        Self {
            gate: Arc::new(gate),
            admin_secret,
        }
    }
}

impl<M: MailStore> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            admin_secret: self.admin_secret.clone(),
        }
    }
}

/// Builds the router.
///
/// Cross-origin requests are allowed from any origin so a separately hosted page
/// can call `/get-code`.
pub fn build_router<M: MailStore>(state: AppState<M>) -> Router {
    Router::new()
        .route("/get-code", post(get_code_handler::<M>))
        .route("/health", get(health_handler::<M>))
        .route("/admin/create-key", post(create_key_handler::<M>))
        .route("/admin/keys", get(list_keys_handler::<M>))
        .route("/admin/delete/:id", delete(delete_key_handler::<M>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct GetCodeRequest {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    #[serde(default)]
    duration_minutes: Option<f64>,
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

async fn get_code_handler<M: MailStore>(
    State(state): State<AppState<M>>,
    body: Option<Json<GetCodeRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let key = request.key.unwrap_or_default();

    Json(state.gate.retrieve(&key).await).into_response()
}

async fn health_handler<M: MailStore>(State(state): State<AppState<M>>) -> Response {
    let connected = state.gate.retriever().manager().is_connected();
    Json(json!({ "status": "ok", "mailboxConnected": connected })).into_response()
}

async fn create_key_handler<M: MailStore>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    body: Option<Json<CreateKeyRequest>>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let request = body.map(|Json(request)| request).unwrap_or_default();

    match state.gate.ledger().create(request.duration_minutes).await {
        Ok(key) => (StatusCode::CREATED, Json(key)).into_response(),
        Err(e @ Error::InvalidDuration { .. }) => {
            message(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Key creation failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Could not create key")
        }
    }
}

async fn list_keys_handler<M: MailStore>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state.gate.ledger().list().await {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => {
            error!(error = %e, "Listing keys failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Could not list keys")
        }
    }
}

async fn delete_key_handler<M: MailStore>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state.gate.ledger().delete(&KeyId::new(id)).await {
        Ok(true) => message(StatusCode::OK, "Deleted"),
        Ok(false) => message(StatusCode::NOT_FOUND, "Key not found"),
        Err(e) => {
            error!(error = %e, "Deleting key failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Could not delete key")
        }
    }
}

fn authorize<M: MailStore>(state: &AppState<M>, headers: &HeaderMap) -> Result<(), Response> {
    let Some(secret) = &state.admin_secret else {
        return Err(message(StatusCode::FORBIDDEN, "Admin routes are disabled"));
    };

    let presented = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());

    let matches = presented.is_some_and(|presented| {
        bool::from(presented.as_bytes().ct_eq(secret.expose_secret().as_bytes()))
    });
    if matches {
        Ok(())
    } else {
        warn!("Rejected admin request with a missing or wrong secret");
        Err(message(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}
