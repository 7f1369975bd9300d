use crate::{
    error::FailureKind,
    handlers::source::SourceOverview,
    models::{
        CheckKind, CreateSourceRequest, HealthState, JobState, JobStatusView, ReconcileStats,
        Source, SourceHealth, StatusCheck,
    },
    response::ApiResponse,
    services::{ScheduleOutcome, SkipReason},
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        // 数据源API
        crate::handlers::source::list_sources,
        crate::handlers::source::create_source,
        // 任务API
        crate::handlers::job::get_source_status,
        crate::handlers::job::trigger_source,
        crate::handlers::job::list_source_checks,
        // 健康监测API
        crate::handlers::health::probe_source,
        crate::handlers::health::get_source_health,
    ),
    components(
        schemas(
            // 数据源相关模型
            Source,
            CreateSourceRequest,
            SourceOverview,
            // 任务相关模型
            JobState,
            JobStatusView,
            StatusCheck,
            CheckKind,
            ScheduleOutcome,
            SkipReason,
            ReconcileStats,
            FailureKind,
            // 健康相关模型
            HealthState,
            SourceHealth,
            // 通用响应模型
            ApiResponse<Source>,
            ApiResponse<Vec<SourceOverview>>,
            ApiResponse<JobStatusView>,
            ApiResponse<ScheduleOutcome>,
            ApiResponse<Vec<StatusCheck>>,
            ApiResponse<SourceHealth>,
        )
    ),
    tags(
        (name = "数据源", description = "数据源的登记与概览"),
        (name = "任务", description = "采集任务的触发、状态与检查日志"),
        (name = "健康监测", description = "数据源连通性探测")
    ),
    info(
        title = "Harvest API",
        version = "1.0.0",
        description = "数据采集与对账服务 REST API 文档",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "开发环境")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_source_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/api/sources"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/sources/{id}/trigger"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/sources/{id}/health"));
    }
}
