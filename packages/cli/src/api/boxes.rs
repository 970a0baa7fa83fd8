// ABOUTME: HTTP handlers for box lifecycle and deployment progress
// ABOUTME: Thin adapters from requests onto BoxManager operations

use super::response::{ApiError, ApiResponse};
use super::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use boxyard_deploy::{CreateBoxRequest, DeployProgress};
use boxyard_storage::{BoxRecord, BoxStatus, StepNode};
use serde::Serialize;
use tracing::info;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
pub struct BoxStatusBody {
    pub box_id: String,
    pub status: BoxStatus,
    /// Whether traffic may be routed to the box
    pub routable: bool,
}

#[derive(Debug, Serialize)]
pub struct RedeployBody {
    pub box_id: String,
    pub attempt: i64,
}

pub async fn create_box(
    State(state): State<AppState>,
    Json(request): Json<CreateBoxRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BoxRecord>>), ApiError> {
    let record = state.manager.create_box(request).await?;
    info!("Box {} created via API", record.id);
    Ok((StatusCode::CREATED, Json(ApiResponse::success(record))))
}

pub async fn list_boxes(State(state): State<AppState>) -> ApiResult<Vec<BoxRecord>> {
    let boxes = state.manager.list_boxes().await?;
    Ok(Json(ApiResponse::success(boxes)))
}

pub async fn get_box(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<BoxRecord> {
    let record = state.manager.get_box(&id).await?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<BoxStatusBody> {
    let status = state.manager.get_status(&id).await?;
    Ok(Json(ApiResponse::success(BoxStatusBody {
        box_id: id,
        status,
        routable: status.is_routable(),
    })))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeployProgress> {
    let progress = state.manager.get_deploy_progress(&id).await?;
    Ok(Json(ApiResponse::success(progress)))
}

pub async fn get_attempt(
    State(state): State<AppState>,
    Path((id, attempt)): Path<(String, i64)>,
) -> ApiResult<Vec<StepNode>> {
    let steps = state.manager.list_attempt_progress(&id, attempt).await?;
    Ok(Json(ApiResponse::success(steps)))
}

pub async fn redeploy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ApiResponse<RedeployBody>>), ApiError> {
    let attempt = state.manager.redeploy(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(RedeployBody { box_id: id, attempt })),
    ))
}

pub async fn delete_box(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<BoxRecord> {
    let record = state.manager.delete_box(&id).await?;
    Ok(Json(ApiResponse::success(record)))
}
