use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    handlers::AppState,
    models::{JobStatusView, StatusCheck},
    response::{ApiResponse, ResponseCode},
    services::ScheduleOutcome,
};

/// 手动触发参数
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct TriggerParams {
    /// 跳过冷却期（不跳过运行中互斥）
    #[serde(default)]
    pub force: bool,
}

/// 检查日志查询参数
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct CheckQueryParams {
    /// 返回条数，默认 20，最大 200
    pub limit: Option<i64>,
}

async fn ensure_source(app_state: &AppState, id: Uuid) -> Result<(), AppError> {
    app_state
        .ctx
        .sources
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("数据源 {}", id)))?;
    Ok(())
}

/// 获取数据源任务状态
///
/// 超过阈值未刷新的 running 状态报告为 error
#[utoipa::path(
    get,
    path = "/api/sources/{id}/status",
    params(("id" = Uuid, Path, description = "数据源ID")),
    responses(
        (status = 200, description = "成功", body = ApiResponse<JobStatusView>),
        (status = 404, description = "数据源不存在")
    ),
    tag = "任务"
)]
pub async fn get_source_status(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<JobStatusView>>, AppError> {
    ensure_source(&app_state, id).await?;
    let view = app_state.tracker.get(id).await?;
    Ok(Json(ApiResponse::success(view)))
}

/// 手动触发采集
#[utoipa::path(
    post,
    path = "/api/sources/{id}/trigger",
    params(("id" = Uuid, Path, description = "数据源ID"), TriggerParams),
    responses(
        (status = 200, description = "已派发", body = ApiResponse<ScheduleOutcome>),
        (status = 409, description = "未派发（运行中、冷却期或未启用）", body = ApiResponse<ScheduleOutcome>),
        (status = 404, description = "数据源不存在")
    ),
    tag = "任务"
)]
pub async fn trigger_source(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<TriggerParams>,
) -> Result<ApiResponse<ScheduleOutcome>, AppError> {
    let outcome = app_state.scheduler.trigger(id, params.force).await?;
    Ok(match &outcome {
        ScheduleOutcome::Dispatched { .. } => {
            ApiResponse::success_with_message(outcome, "任务已派发".to_string())
        }
        ScheduleOutcome::Skipped { reason, .. } => {
            let msg = format!("任务未派发: {}", reason);
            ApiResponse::error_with_data(ResponseCode::CONFLICT, msg, outcome)
        }
    })
}

/// 获取状态检查日志
#[utoipa::path(
    get,
    path = "/api/sources/{id}/checks",
    params(("id" = Uuid, Path, description = "数据源ID"), CheckQueryParams),
    responses(
        (status = 200, description = "成功", body = ApiResponse<Vec<StatusCheck>>),
        (status = 404, description = "数据源不存在")
    ),
    tag = "任务"
)]
pub async fn list_source_checks(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<CheckQueryParams>,
) -> Result<Json<ApiResponse<Vec<StatusCheck>>>, AppError> {
    ensure_source(&app_state, id).await?;
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let checks = app_state.tracker.recent_checks(id, limit).await?;
    Ok(Json(ApiResponse::success(checks)))
}
