//! JSON handlers.

use super::AppState;
use crate::error::ApiError;
use crate::pipeline::{ApproveRequest, CreatePipeline};
use crate::types::PipelineMode;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.code.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.code.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            match self.code {
                crate::error::ErrorCode::RollbackUnavailable => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        (status, Json(json!({ "error": self }))).into_response()
    }
}

type HandlerResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    #[serde(default, alias = "reviewedBy")]
    reviewed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    mode: PipelineMode,
}

#[derive(Debug, Deserialize)]
pub struct FormatQuery {
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    mode: Option<PipelineMode>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(request): Json<CreatePipeline>,
) -> HandlerResult<impl IntoResponse> {
    let pipeline = state.orchestrator.create_pipeline(request)?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

pub async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> HandlerResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.orchestrator.list_recent(limit)?))
}

pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> HandlerResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.details(id)?))
}

pub async fn get_staging(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> HandlerResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.staging(id)?))
}

pub async fn get_runbook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<FormatQuery>,
) -> HandlerResult<Response> {
    let runbook = state.orchestrator.runbook(id)?;
    if query.format.as_deref() == Some("markdown") {
        return Ok((
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            runbook.to_markdown(),
        )
            .into_response());
    }
    Ok(Json(runbook).into_response())
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ApproveRequest>>,
) -> HandlerResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.orchestrator.approve(id, request).await?))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ReviewRequest>>,
) -> HandlerResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(
        state
            .orchestrator
            .reject(id, request.reviewed_by.as_deref())?,
    ))
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ReviewRequest>>,
) -> HandlerResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(
        state
            .orchestrator
            .rollback(id, request.reviewed_by.as_deref())
            .await?,
    ))
}

pub async fn get_terminal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> HandlerResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.transcript(id)?))
}

pub async fn get_mode(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> HandlerResult<impl IntoResponse> {
    let mode = state.orchestrator.get_mode(id)?;
    Ok(Json(json!({ "pipeline_id": id, "mode": mode })))
}

pub async fn set_mode(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ModeRequest>,
) -> HandlerResult<impl IntoResponse> {
    let pipeline = state.orchestrator.set_mode(id, request.mode)?;
    Ok(Json(json!({ "pipeline_id": id, "mode": pipeline.mode })))
}

pub async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let statuses: Vec<_> = state.runtimes.iter().map(|r| r.status()).collect();
    Json(statuses)
}

pub async fn llm_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.llm.metrics())
}

pub async fn list_tools(
    State(state): State<AppState>,
    Query(query): Query<ToolsQuery>,
) -> impl IntoResponse {
    let mode = query.mode.unwrap_or_default();
    Json(state.orchestrator.tools().tools_for_mode(mode))
}
