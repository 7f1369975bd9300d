use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::response::{ApiResponse, ResponseCode};

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("采集错误: {0}")]
    Collector(#[from] CollectorError),

    /// 条件写入未命中（记录已被并发修改），重读后可重试
    #[error("存储冲突: {0}")]
    StoreConflict(String),

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("资源不存在: {resource}")]
    NotFound { resource: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            AppError::Database(_) => (ResponseCode::DATABASE_ERROR, self.to_string()),
            AppError::Serialization(_) => {
                (ResponseCode::INTERNAL_ERROR, "数据序列化错误".to_string())
            }
            AppError::Io(_) => (ResponseCode::INTERNAL_ERROR, "文件IO错误".to_string()),
            AppError::Config(_) => (ResponseCode::INTERNAL_ERROR, "配置错误".to_string()),
            AppError::Validation(msg) => (ResponseCode::BAD_REQUEST, msg.clone()),
            AppError::Collector(_) => (ResponseCode::COLLECTOR_ERROR, self.to_string()),
            AppError::StoreConflict(_) => (ResponseCode::CONFLICT, self.to_string()),
            AppError::Internal(_) => (ResponseCode::INTERNAL_ERROR, "服务器内部错误".to_string()),
            AppError::BadRequest(msg) => (ResponseCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound { resource } => {
                (ResponseCode::NOT_FOUND, format!("资源不存在: {}", resource))
            }
        };

        // 记录错误日志
        tracing::error!("应用错误: {}", self);

        ApiResponse::<()>::error(code, message).into_response()
    }
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn store_conflict<T: Into<String>>(msg: T) -> Self {
        Self::StoreConflict(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// 将错误归类到任务失败分类，用于执行器的重试决策
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Database(_) => FailureKind::TransientDatabase,
                _ => FailureKind::Unexpected,
            },
            AppError::StoreConflict(_) => FailureKind::TransientDatabase,
            AppError::Collector(e) => e.kind(),
            _ => FailureKind::Unexpected,
        }
    }
}

/// 任务失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 网络抖动、连接失败、单次请求超时
    TransientNetwork,
    /// 数据库连接/事务失败
    TransientDatabase,
    /// 站点结构变化等采集层面的失败
    DomainCollection,
    /// 任务硬截止时间已过
    Timeout,
    /// 未知错误，不重试
    Unexpected,
}

impl FailureKind {
    /// 是否属于可重试的失败
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientNetwork
                | FailureKind::TransientDatabase
                | FailureKind::DomainCollection
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::TransientNetwork => write!(f, "transient_network"),
            FailureKind::TransientDatabase => write!(f, "transient_database"),
            FailureKind::DomainCollection => write!(f, "domain_collection"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Unexpected => write!(f, "unexpected"),
        }
    }
}

/// 采集器返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("页面结构异常: {0}")]
    Structure(String),

    #[error("未知错误: {0}")]
    Unexpected(String),
}

impl CollectorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            // 单次请求超时按网络抖动处理；任务级硬超时由执行器单独判定
            CollectorError::Network(_) | CollectorError::Timeout(_) => {
                FailureKind::TransientNetwork
            }
            CollectorError::Database(_) => FailureKind::TransientDatabase,
            CollectorError::Structure(_) => FailureKind::DomainCollection,
            CollectorError::Unexpected(_) => FailureKind::Unexpected,
        }
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CollectorError::Timeout(e.to_string())
        } else if e.is_decode() {
            CollectorError::Structure(e.to_string())
        } else if e.is_connect() || e.is_request() || e.is_body() {
            CollectorError::Network(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                CollectorError::Network(e.to_string())
            } else {
                CollectorError::Structure(e.to_string())
            }
        } else {
            CollectorError::Unexpected(e.to_string())
        }
    }
}
