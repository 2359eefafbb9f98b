//! REST control plane.
//!
//! Routes live under `/api/v1`; `/health` answers at the root. When an API
//! key is configured, every `/api/v1` request must carry it in `X-Api-Key`.

mod auth;
mod error;
mod tasks;

pub use error::ApiError;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router, extract::Request, extract::State};
use serde_json::json;

use crate::task::TaskScheduler;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The task engine.
    pub scheduler: Arc<TaskScheduler>,
    /// Required `X-Api-Key` value, when configured.
    pub api_key: Option<Arc<str>>,
}

/// Builds the full router.
#[must_use]
pub fn create_router(scheduler: Arc<TaskScheduler>, api_key: Option<String>) -> Router {
    let state = AppState {
        scheduler,
        api_key: api_key.map(Arc::from),
    };

    let api = Router::new()
        .route("/tasks/download", post(tasks::create))
        .route("/tasks", get(tasks::list))
        .route("/tasks/config", get(tasks::get_config).put(tasks::put_config))
        .route("/tasks/{id}", get(tasks::get).delete(tasks::delete))
        .route("/tasks/{id}/{action}", post(tasks::control))
        .route("/auth/{source}", put(auth::put).get(auth::get))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
}

/// Rejects `/api/v1` requests without the configured key.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        let presented = request
            .headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected.as_ref()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid api key" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

/// Liveness probe.
async fn health_check() -> &'static str {
    "OK"
}
