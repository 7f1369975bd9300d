use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    handlers::AppState,
    models::SourceHealth,
    response::{ApiResponse, ResponseCode},
};

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    detail: bool,
}

/// 服务健康检查
pub async fn health_check(
    State(app_state): State<AppState>,
    Query(params): Query<HealthQuery>,
) -> ApiResponse<serde_json::Value> {
    if !params.detail {
        return ApiResponse::success(serde_json::json!({"status": "ok"}));
    }

    let database = match &app_state.ctx.database {
        Some(db) => match db.health_check().await {
            Ok(true) => "healthy",
            Ok(false) => "unhealthy",
            Err(e) => {
                tracing::error!("数据库健康检查失败: {}", e);
                "error"
            }
        },
        None => "in_memory",
    };
    let queued = app_state.ctx.queue.len().await.unwrap_or(-1);

    let details = serde_json::json!({
        "status": if database == "healthy" || database == "in_memory" { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "queued_jobs": queued,
        "timestamp": app_state.ctx.now().to_rfc3339(),
    });

    if database == "unhealthy" || database == "error" {
        ApiResponse::error_with_data(
            ResponseCode::SERVICE_UNAVAILABLE,
            "数据库连接异常".to_string(),
            details,
        )
    } else {
        ApiResponse::success(details)
    }
}

/// 立即探测数据源连通性
#[utoipa::path(
    post,
    path = "/api/sources/{id}/probe",
    params(("id" = Uuid, Path, description = "数据源ID")),
    responses(
        (status = 200, description = "探测完成", body = ApiResponse<SourceHealth>),
        (status = 404, description = "数据源不存在")
    ),
    tag = "健康监测"
)]
pub async fn probe_source(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<SourceHealth>>, AppError> {
    let health = app_state.health.probe_source(id).await?;
    Ok(Json(ApiResponse::success(health)))
}

/// 获取最近一次健康探测结果
#[utoipa::path(
    get,
    path = "/api/sources/{id}/health",
    params(("id" = Uuid, Path, description = "数据源ID")),
    responses(
        (status = 200, description = "成功", body = ApiResponse<SourceHealth>),
        (status = 404, description = "尚未探测或数据源不存在")
    ),
    tag = "健康监测"
)]
pub async fn get_source_health(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<SourceHealth>>, AppError> {
    let health = app_state
        .tracker
        .get_health(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("数据源 {} 的健康状态", id)))?;
    Ok(Json(ApiResponse::success(health)))
}
