//! Auth-session endpoints.
//!
//! Credentials are opaque to the server: the client pushes whatever the
//! source adapter needs (cookies, tokens, base URLs) and it is stored
//! verbatim, keyed by source. The server never refreshes a session; when an
//! upstream rejects one, the affected task fails and the client re-pushes.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use crate::comic::Source;

/// `PUT /auth/{source}` — store the blob verbatim.
pub async fn put(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let source: Source = source
        .parse()
        .map_err(|reason: String| ApiError::bad_request(reason))?;
    let payload = body.to_string();
    state.scheduler.store().put_auth(source, &payload).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /auth/{source}` — existence and freshness only, never the payload.
pub async fn get(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let source: Source = source
        .parse()
        .map_err(|reason: String| ApiError::bad_request(reason))?;
    match state.scheduler.store().get_auth(source).await? {
        Some((_, updated_at)) => Ok(Json(json!({
            "ok": true,
            "exists": true,
            "updatedAt": updated_at,
        }))),
        None => Ok(Json(json!({ "ok": true, "exists": false }))),
    }
}
