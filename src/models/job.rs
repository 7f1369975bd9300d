use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// 队列中的一次任务尝试
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct JobTicket {
    pub id: Uuid,
    pub source_id: Uuid,
    pub correlation_id: Uuid,
    /// 第几次尝试（从1开始）
    pub attempt: i32,
    /// 最早可被领取的时间
    pub available_at: DateTime<Utc>,
    /// 任务硬截止时间，所有重试共用
    pub deadline: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobTicket {
    /// 首次派发
    pub fn first(
        source_id: Uuid,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            correlation_id,
            attempt: 1,
            available_at: now,
            deadline,
            enqueued_at: now,
        }
    }

    /// 延迟后的下一次尝试，沿用关联ID与截止时间
    pub fn next_attempt(&self, now: DateTime<Utc>, available_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: self.source_id,
            correlation_id: self.correlation_id,
            attempt: self.attempt + 1,
            available_at,
            deadline: self.deadline,
            enqueued_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
