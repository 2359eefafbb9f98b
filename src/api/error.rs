//! JSON error responses for the control plane.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::task::SchedulerError;

/// An error with the HTTP status it maps to.
///
/// The body is always `{"error": "..."}` plus optional extra fields.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl ApiError {
    /// Builds an error with a status and message.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// 400 with a message.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 404 with a message.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Attaches an extra body field.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if let Some(object) = body.as_object_mut() {
            object.extend(self.extra);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match &error {
            SchedulerError::AlreadyDownloaded { comic_id } => {
                Self::new(StatusCode::CONFLICT, error.to_string())
                    .with_field("comicId", json!(comic_id))
            }
            SchedulerError::TaskExists
            | SchedulerError::TaskRunning
            | SchedulerError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, error.to_string())
            }
            SchedulerError::NotFound => Self::new(StatusCode::NOT_FOUND, error.to_string()),
            SchedulerError::BadTarget(_) => {
                Self::new(StatusCode::BAD_REQUEST, error.to_string())
            }
            SchedulerError::Store(_) | SchedulerError::Library(_) | SchedulerError::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
        }
    }
}

impl From<crate::task::StoreError> for ApiError {
    fn from(error: crate::task::StoreError) -> Self {
        match error {
            crate::task::StoreError::NotFound => Self::not_found("task not found"),
            crate::task::StoreError::Db(db) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, db.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_statuses() {
        let already = ApiError::from(SchedulerError::AlreadyDownloaded {
            comic_id: "nhentai1".into(),
        });
        assert_eq!(already.status, StatusCode::CONFLICT);
        assert_eq!(already.message, "already downloaded");
        assert!(already.extra.contains_key("comicId"));

        assert_eq!(
            ApiError::from(SchedulerError::TaskExists).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SchedulerError::NotFound).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(SchedulerError::TaskRunning).message,
            "task is running"
        );
    }
}
