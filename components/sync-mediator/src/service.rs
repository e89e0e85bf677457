/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The HTTP face of the mediator: `POST /api/sync` plus CORS preflight.
//! Anything else on the path is 404, bad tokens are 401, and internal
//! failures surface as 500 with `{error}`.

use crate::auth::{self, AuthError};
use crate::{apply_sync, MediatorConfig};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tunesync::SyncRequest;

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<MediatorConfig>,
}

impl AppState {
    pub fn new(conn: Connection, config: MediatorConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sync",
            post(handle_sync)
                .options(handle_preflight)
                .fallback(handle_not_found),
        )
        .fallback(handle_not_found)
        .with_state(state)
}

fn cors_headers(headers: &HeaderMap) -> [(HeaderName, String); 3] {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin),
        (
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "POST, OPTIONS".to_string(),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Authorization, Content-Type".to_string(),
        ),
    ]
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    Ok(auth::verify_token(state.config.auth_secret.as_bytes(), token)?.sub)
}

async fn handle_preflight(headers: HeaderMap) -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers(&headers))
}

async fn handle_not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

async fn handle_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Response {
    let cors = cors_headers(&headers);
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(e) => {
            log::debug!("rejecting sync request: {}", e);
            return (
                StatusCode::UNAUTHORIZED,
                cors,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    // rusqlite is synchronous; keep it off the async executor.
    let joined = tokio::task::spawn_blocking(move || {
        let conn = state.db.lock();
        apply_sync(&conn, &user, &request, &state.config)
    })
    .await;
    match joined {
        Ok(Ok(response)) => (StatusCode::OK, cors, Json(response)).into_response(),
        Ok(Err(e)) => {
            log::error!("sync request failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                cors,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            log::error!("sync task panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                cors,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}
