use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// 采集任务状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "job_state_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// 尚未执行过
    Unknown,
    /// 执行中
    Running,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Unknown => write!(f, "unknown"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Error => write!(f, "error"),
        }
    }
}

/// 数据源任务状态（每个数据源一行）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct JobStatus {
    pub source_id: Uuid,
    pub state: JobState,
    /// 当前任务实例的关联ID
    pub correlation_id: Option<Uuid>,
    /// 当前尝试次数（从1开始）
    pub attempt: i32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    /// 尚无状态行时的占位状态
    pub fn unknown(source_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            source_id,
            state: JobState::Unknown,
            correlation_id: None,
            attempt: 0,
            last_checked_at: None,
            started_at: None,
            error_message: None,
            response_time_ms: None,
            updated_at: now,
        }
    }

    /// running 状态超过阈值未刷新
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        match self.last_checked_at {
            Some(at) => now - at > threshold,
            None => true,
        }
    }

    /// 对外展示的状态，僵死的 running 报告为 error
    pub fn view(&self, now: DateTime<Utc>, threshold: Duration) -> JobStatusView {
        let stale = self.is_stale(now, threshold);
        let (state, error_message) = if stale {
            (JobState::Error, Some(stale_message(threshold)))
        } else {
            (self.state, self.error_message.clone())
        };

        JobStatusView {
            source_id: self.source_id,
            state,
            persisted_state: self.state,
            is_stale: stale,
            correlation_id: self.correlation_id,
            attempt: self.attempt,
            last_checked_at: self.last_checked_at,
            started_at: self.started_at,
            error_message,
            response_time_ms: self.response_time_ms,
        }
    }
}

/// 僵死任务的错误信息
pub fn stale_message(threshold: Duration) -> String {
    format!("任务超时: 超过 {} 秒未更新状态", threshold.num_seconds())
}

/// 状态查询结果
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobStatusView {
    pub source_id: Uuid,
    /// 派生状态（已考虑僵死判定）
    pub state: JobState,
    /// 数据库中持久化的状态
    pub persisted_state: JobState,
    pub is_stale: bool,
    pub correlation_id: Option<Uuid>,
    pub attempt: i32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
}

/// 尝试切换到 running 的结果
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// 已切换为 running，当前任务持有状态
    Acquired(JobStatus),
    /// 已有任务在运行
    AlreadyRunning(JobStatus),
}

/// 健康探测状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Working,
    NotWorking,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Working => write!(f, "working"),
            HealthState::NotWorking => write!(f, "not_working"),
        }
    }
}

impl std::str::FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(HealthState::Working),
            "not_working" => Ok(HealthState::NotWorking),
            _ => Err(format!("Invalid health status: {}", s)),
        }
    }
}

impl TryFrom<String> for HealthState {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 数据源健康探测结果（与任务状态分开存储）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SourceHealth {
    pub source_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: HealthState,
    pub response_time_ms: i64,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// 状态检查日志类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Job,
    Probe,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Job => write!(f, "job"),
            CheckKind::Probe => write!(f, "probe"),
        }
    }
}

/// 状态检查日志（只追加）
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct StatusCheck {
    pub id: i64,
    pub source_id: Uuid,
    pub kind: String,
    pub outcome: String,
    pub correlation_id: Option<Uuid>,
    pub response_time_ms: Option<i64>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// 新增状态检查日志
#[derive(Debug, Clone)]
pub struct NewStatusCheck {
    pub source_id: Uuid,
    pub kind: CheckKind,
    pub outcome: String,
    pub correlation_id: Option<Uuid>,
    pub response_time_ms: Option<i64>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}
