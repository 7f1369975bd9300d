use crate::{
    database::Database,
    error::AppResult,
    models::{JobStatus, NewStatusCheck, SourceHealth, StatusCheck, TransitionOutcome},
    repositories::StatusStore,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

const STATUS_COLUMNS: &str = "source_id, state, correlation_id, attempt, last_checked_at, started_at, error_message, response_time_ms, updated_at";

/// 任务状态仓库
#[derive(Debug, Clone)]
pub struct JobStatusRepository {
    db: Database,
}

impl JobStatusRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl StatusStore for JobStatusRepository {
    async fn get(&self, source_id: Uuid) -> AppResult<Option<JobStatus>> {
        let query = format!("SELECT {STATUS_COLUMNS} FROM job_statuses WHERE source_id = $1");
        let status = sqlx::query_as::<_, JobStatus>(&query)
            .bind(source_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(status)
    }

    async fn list(&self) -> AppResult<Vec<JobStatus>> {
        let query = format!("SELECT {STATUS_COLUMNS} FROM job_statuses ORDER BY updated_at DESC");
        let statuses = sqlx::query_as::<_, JobStatus>(&query)
            .fetch_all(self.db.pool())
            .await?;

        Ok(statuses)
    }

    async fn try_transition_to_running(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<TransitionOutcome> {
        // 单条语句完成检查与写入：冲突行仅在非 running 或已僵死时被覆盖
        let query = format!(
            r#"
            INSERT INTO job_statuses
                (source_id, state, correlation_id, attempt, last_checked_at, started_at, error_message, response_time_ms, updated_at)
            VALUES ($1, 'running', $2, 1, $3, $3, NULL, NULL, $3)
            ON CONFLICT (source_id) DO UPDATE SET
                state = 'running',
                correlation_id = EXCLUDED.correlation_id,
                attempt = 1,
                last_checked_at = EXCLUDED.last_checked_at,
                started_at = EXCLUDED.started_at,
                error_message = NULL,
                response_time_ms = NULL,
                updated_at = EXCLUDED.updated_at
            WHERE job_statuses.state <> 'running'
               OR job_statuses.last_checked_at IS NULL
               OR job_statuses.last_checked_at < $4
            RETURNING {STATUS_COLUMNS}
            "#
        );

        let acquired = sqlx::query_as::<_, JobStatus>(&query)
            .bind(source_id)
            .bind(correlation_id)
            .bind(now)
            .bind(stale_before)
            .fetch_optional(self.db.pool())
            .await?;

        if let Some(status) = acquired {
            return Ok(TransitionOutcome::Acquired(status));
        }

        let current = self.get(source_id).await?;
        Ok(TransitionOutcome::AlreadyRunning(
            current.unwrap_or_else(|| JobStatus::unknown(source_id, now)),
        ))
    }

    async fn heartbeat(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_statuses
            SET last_checked_at = $3, attempt = $4, updated_at = $3
            WHERE source_id = $1 AND correlation_id = $2 AND state = 'running'
            "#,
        )
        .bind(source_id)
        .bind(correlation_id)
        .bind(now)
        .bind(attempt)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        response_time_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_statuses
            SET state = 'completed', last_checked_at = $3, error_message = NULL,
                response_time_ms = $4, updated_at = $3
            WHERE source_id = $1 AND correlation_id = $2 AND state = 'running'
            "#,
        )
        .bind(source_id)
        .bind(correlation_id)
        .bind(now)
        .bind(response_time_ms)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_statuses
            SET state = 'error', last_checked_at = $3, error_message = $4, updated_at = $3
            WHERE source_id = $1 AND correlation_id = $2 AND state = 'running'
            "#,
        )
        .bind(source_id)
        .bind(correlation_id)
        .bind(now)
        .bind(message)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_stale(
        &self,
        stale_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobStatus>> {
        let query = format!(
            r#"
            UPDATE job_statuses
            SET state = 'error', error_message = $2, updated_at = $3
            WHERE state = 'running'
              AND (last_checked_at IS NULL OR last_checked_at < $1)
            RETURNING {STATUS_COLUMNS}
            "#
        );

        let swept = sqlx::query_as::<_, JobStatus>(&query)
            .bind(stale_before)
            .bind(message)
            .bind(now)
            .fetch_all(self.db.pool())
            .await?;

        Ok(swept)
    }

    async fn record_health(&self, health: &SourceHealth) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_health (source_id, status, response_time_ms, error_message, checked_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id) DO UPDATE SET
                status = EXCLUDED.status,
                response_time_ms = EXCLUDED.response_time_ms,
                error_message = EXCLUDED.error_message,
                checked_at = EXCLUDED.checked_at
            "#,
        )
        .bind(health.source_id)
        .bind(health.status.to_string())
        .bind(health.response_time_ms)
        .bind(&health.error_message)
        .bind(health.checked_at)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn get_health(&self, source_id: Uuid) -> AppResult<Option<SourceHealth>> {
        let health = sqlx::query_as::<_, SourceHealth>(
            r#"
            SELECT source_id, status, response_time_ms, error_message, checked_at
            FROM source_health
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(health)
    }

    async fn list_health(&self) -> AppResult<Vec<SourceHealth>> {
        let rows = sqlx::query_as::<_, SourceHealth>(
            r#"
            SELECT source_id, status, response_time_ms, error_message, checked_at
            FROM source_health
            ORDER BY checked_at DESC
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    async fn append_check(&self, check: &NewStatusCheck) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO status_checks
                (source_id, kind, outcome, correlation_id, response_time_ms, message, checked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(check.source_id)
        .bind(check.kind.to_string())
        .bind(&check.outcome)
        .bind(check.correlation_id)
        .bind(check.response_time_ms)
        .bind(&check.message)
        .bind(check.checked_at)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn recent_checks(&self, source_id: Uuid, limit: i64) -> AppResult<Vec<StatusCheck>> {
        let checks = sqlx::query_as::<_, StatusCheck>(
            r#"
            SELECT id, source_id, kind, outcome, correlation_id, response_time_ms, message, checked_at
            FROM status_checks
            WHERE source_id = $1
            ORDER BY checked_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(checks)
    }
}
