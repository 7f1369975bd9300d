use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    error::AppError,
    handlers::AppState,
    models::{CreateSourceRequest, JobStatus, JobStatusView, Source, SourceHealth},
    response::ApiResponse,
};

/// 数据源列表查询参数
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SourceQueryParams {
    /// 是否只返回活跃数据源
    #[serde(default)]
    pub active_only: bool,
}

/// 数据源概览：基本信息、派生任务状态与健康状态
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SourceOverview {
    pub source: Source,
    pub status: JobStatusView,
    pub health: Option<SourceHealth>,
}

/// 获取数据源列表
#[utoipa::path(
    get,
    path = "/api/sources",
    params(SourceQueryParams),
    responses(
        (status = 200, description = "成功获取数据源列表", body = ApiResponse<Vec<SourceOverview>>),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "数据源"
)]
pub async fn list_sources(
    State(app_state): State<AppState>,
    Query(params): Query<SourceQueryParams>,
) -> Result<Json<ApiResponse<Vec<SourceOverview>>>, AppError> {
    let sources = app_state.ctx.sources.list(params.active_only).await?;
    let mut statuses = app_state.tracker.list().await?;
    let mut health = app_state.tracker.list_health().await?;
    let now = app_state.ctx.now();
    let threshold = app_state.ctx.stale_threshold();

    let overviews = sources
        .into_iter()
        .map(|source| {
            let status = statuses
                .iter()
                .position(|s| s.source_id == source.id)
                .map(|i| statuses.swap_remove(i))
                .unwrap_or_else(|| JobStatus::unknown(source.id, now).view(now, threshold));
            let health = health
                .iter()
                .position(|h| h.source_id == source.id)
                .map(|i| health.swap_remove(i));
            SourceOverview {
                source,
                status,
                health,
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(overviews)))
}

/// 创建数据源
#[utoipa::path(
    post,
    path = "/api/sources",
    request_body = CreateSourceRequest,
    responses(
        (status = 200, description = "创建成功", body = ApiResponse<Source>),
        (status = 400, description = "请求参数错误")
    ),
    tag = "数据源"
)]
pub async fn create_source(
    State(app_state): State<AppState>,
    Json(request): Json<CreateSourceRequest>,
) -> Result<Json<ApiResponse<Source>>, AppError> {
    request.validate().map_err(AppError::validation)?;
    let source = app_state
        .ctx
        .sources
        .create(&request, app_state.ctx.now())
        .await?;
    tracing::info!("创建数据源: {} ({})", source.name, source.id);
    Ok(Json(ApiResponse::success(source)))
}
