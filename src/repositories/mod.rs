//! 存储层
//!
//! 四类存储接口各有 PostgreSQL 与内存两套实现。所有互斥与顺序保证都落在
//! 存储的条件写入上（PostgreSQL 的条件 UPDATE / 事务，内存实现的单把锁），
//! 不依赖进程内的状态。

pub mod job_queue;
pub mod job_status;
pub mod memory;
pub mod record;
pub mod source;

pub use job_queue::JobQueueRepository;
pub use job_status::JobStatusRepository;
pub use memory::MemoryStore;
pub use record::RecordRepository;
pub use source::SourceRepository;

use crate::{
    error::AppResult,
    models::{
        CreateSourceRequest, JobStatus, JobTicket, NewStatusCheck, Record, RecordChange,
        RecordHistory, Source, SourceHealth, StatusCheck, TransitionOutcome,
    },
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// 数据源存储
#[async_trait::async_trait]
pub trait SourceStore: Send + Sync {
    /// 创建数据源
    async fn create(&self, request: &CreateSourceRequest, now: DateTime<Utc>) -> AppResult<Source>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Source>>;

    /// 列出数据源
    async fn list(&self, active_only: bool) -> AppResult<Vec<Source>>;

    /// 记录一次成功采集
    async fn mark_collected(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()>;
}

/// 任务状态存储（每个数据源一行权威状态）
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, source_id: Uuid) -> AppResult<Option<JobStatus>>;

    async fn list(&self) -> AppResult<Vec<JobStatus>>;

    /// 原子地检查并切换到 running
    ///
    /// 当前状态不是 running，或 running 但 `last_checked_at` 早于 `stale_before`
    /// 时切换成功；否则返回当前的运行中状态。
    async fn try_transition_to_running(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<TransitionOutcome>;

    /// 刷新运行中任务的 `last_checked_at`，关联ID不匹配时返回 false
    async fn heartbeat(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// running -> completed，关联ID不匹配或已不在运行时返回 false
    async fn complete(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        response_time_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// running -> error，关联ID不匹配或已不在运行时返回 false
    async fn fail(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// 将僵死的 running 持久化为 error，返回被修正的行
    async fn sweep_stale(
        &self,
        stale_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobStatus>>;

    /// 写入健康探测结果（独立于任务状态）
    async fn record_health(&self, health: &SourceHealth) -> AppResult<()>;

    async fn get_health(&self, source_id: Uuid) -> AppResult<Option<SourceHealth>>;

    async fn list_health(&self) -> AppResult<Vec<SourceHealth>>;

    /// 追加状态检查日志
    async fn append_check(&self, check: &NewStatusCheck) -> AppResult<()>;

    /// 最近的状态检查日志，按时间倒序
    async fn recent_checks(&self, source_id: Uuid, limit: i64) -> AppResult<Vec<StatusCheck>>;
}

/// 业务记录存储
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// 按自然键批量查询当前 latest 记录
    async fn find_latest(
        &self,
        source_id: Uuid,
        keys: &[String],
    ) -> AppResult<HashMap<String, Record>>;

    /// 在一个事务内按顺序应用一批写操作
    async fn apply_changes(&self, changes: &[RecordChange], now: DateTime<Utc>) -> AppResult<()>;

    async fn list_latest(&self, source_id: Uuid) -> AppResult<Vec<Record>>;

    /// 某自然键的历史快照，按版本升序
    async fn history(&self, source_id: Uuid, natural_key: &str) -> AppResult<Vec<RecordHistory>>;
}

/// 持久化任务队列
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, ticket: &JobTicket) -> AppResult<()>;

    /// 领取一个到期的任务并从队列移除
    async fn claim_next(&self, now: DateTime<Utc>) -> AppResult<Option<JobTicket>>;

    /// 队列中的任务数
    async fn len(&self) -> AppResult<i64>;
}
