use crate::handlers::{
    AppState, create_source, get_source_health, get_source_status, list_source_checks,
    list_sources, probe_source, trigger_source,
};
use axum::{
    Router,
    routing::{get, post},
};

/// 创建API路由
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        // 数据源
        .route("/api/sources", get(list_sources))
        .route("/api/sources", post(create_source))
        // 任务状态与触发
        .route("/api/sources/{id}/status", get(get_source_status))
        .route("/api/sources/{id}/trigger", post(trigger_source))
        .route("/api/sources/{id}/checks", get(list_source_checks))
        // 健康监测
        .route("/api/sources/{id}/probe", post(probe_source))
        .route("/api/sources/{id}/health", get(get_source_health))
}
