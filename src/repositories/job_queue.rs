use crate::{database::Database, error::AppResult, models::JobTicket, repositories::JobQueue};
use chrono::{DateTime, Utc};

/// 持久化任务队列仓库
#[derive(Debug, Clone)]
pub struct JobQueueRepository {
    db: Database,
}

impl JobQueueRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl JobQueue for JobQueueRepository {
    async fn enqueue(&self, ticket: &JobTicket) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, source_id, correlation_id, attempt, available_at, deadline, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.source_id)
        .bind(ticket.correlation_id)
        .bind(ticket.attempt)
        .bind(ticket.available_at)
        .bind(ticket.deadline)
        .bind(ticket.enqueued_at)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> AppResult<Option<JobTicket>> {
        // SKIP LOCKED 保证多个 worker 不会领取同一行
        let ticket = sqlx::query_as::<_, JobTicket>(
            r#"
            DELETE FROM job_queue
            WHERE id = (
                SELECT id FROM job_queue
                WHERE available_at <= $1
                ORDER BY available_at ASC, enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, source_id, correlation_id, attempt, available_at, deadline, enqueued_at
            "#,
        )
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(ticket)
    }

    async fn len(&self) -> AppResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_queue")
            .fetch_one(self.db.pool())
            .await?;

        Ok(count)
    }
}
