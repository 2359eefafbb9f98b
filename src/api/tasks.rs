//! Task endpoints: create, list, inspect, control, configure.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use crate::comic::Source;
use crate::task::{Task, TaskParams};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

/// Body of `POST /tasks/download`.
#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    source: String,
    target: String,
    #[serde(default)]
    eps: Option<Vec<u32>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "coverUrl")]
    cover_url: Option<String>,
}

/// Task representation returned by the list/detail endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    id: String,
    #[serde(rename = "type")]
    task_type: String,
    source: String,
    target: String,
    status: String,
    progress: i64,
    total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comic_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

impl TaskDto {
    fn from_task(task: &Task, include_params: bool) -> Self {
        let params = include_params
            .then(|| serde_json::from_str(&task.params).unwrap_or(serde_json::Value::Null));
        Self {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            source: task.source_str.clone(),
            target: task.target.clone(),
            status: task.status().as_str().to_string(),
            progress: task.progress,
            total: task.total,
            message: task.message.clone(),
            comic_id: task.comic_id.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            params,
        }
    }
}

/// `POST /tasks/download`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let source: Source = body
        .source
        .parse()
        .map_err(|reason: String| ApiError::bad_request(reason))?;

    let params = TaskParams {
        eps: body.eps,
        title: body.title,
        cover_url: body.cover_url,
        extra: serde_json::Map::new(),
    };

    let task = state
        .scheduler
        .create_download_task(source, &body.target, params)
        .await?;
    Ok(Json(json!({ "ok": true, "taskId": task.id })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

/// `GET /tasks?limit=N`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let tasks = state.scheduler.store().list(limit).await?;
    let dtos: Vec<TaskDto> = tasks
        .iter()
        .map(|task| TaskDto::from_task(task, false))
        .collect();
    Ok(Json(json!({ "ok": true, "tasks": dtos })))
}

/// `GET /tasks/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state.scheduler.store().get(&id).await?;
    Ok(Json(json!({ "ok": true, "task": TaskDto::from_task(&task, true) })))
}

/// `POST /tasks/{id}/{action}` for pause/resume/cancel/retry.
pub async fn control(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match action.as_str() {
        "pause" => state.scheduler.pause(&id).await?,
        "resume" => state.scheduler.resume(&id).await?,
        "cancel" => state.scheduler.cancel(&id).await?,
        "retry" => state.scheduler.retry(&id).await?,
        other => return Err(ApiError::not_found(format!("unknown action: {other}"))),
    }
    Ok(Json(json!({ "ok": true })))
}

/// `DELETE /tasks/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.scheduler.delete(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `GET /tasks/config`
pub async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let policy = state.scheduler.policy();
    Json(json!({
        "ok": true,
        "maxConcurrent": policy.max_concurrent(),
        "fileConcurrent": policy.file_concurrent_default(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigBody {
    #[serde(rename = "maxConcurrent")]
    max_concurrent: Option<usize>,
    #[serde(rename = "fileConcurrent")]
    file_concurrent: Option<usize>,
}

/// `PUT /tasks/config`
pub async fn put_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigBody>,
) -> Json<serde_json::Value> {
    let mut policy = state.scheduler.policy();
    if let Some(max_concurrent) = body.max_concurrent {
        policy = policy.with_max_concurrent(max_concurrent);
    }
    if let Some(file_concurrent) = body.file_concurrent {
        policy = policy.with_file_concurrent_default(file_concurrent);
    }
    state.scheduler.set_policy(policy);

    let policy = state.scheduler.policy();
    Json(json!({
        "ok": true,
        "maxConcurrent": policy.max_concurrent(),
        "fileConcurrent": policy.file_concurrent_default(),
    }))
}
