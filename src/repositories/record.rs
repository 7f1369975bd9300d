use crate::{
    database::Database,
    error::{AppError, AppResult},
    models::{NewRecord, Record, RecordChange, RecordHistory},
    repositories::RecordStore,
};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

/// 业务记录仓库
#[derive(Debug, Clone)]
pub struct RecordRepository {
    db: Database,
}

impl RecordRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn insert(tx: &mut Transaction<'_, Postgres>, record: &NewRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records
                (id, source_id, natural_key, external_id, content, content_hash, version, is_latest, imported_at, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, true, $8, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.source_id)
        .bind(&record.natural_key)
        .bind(&record.external_id)
        .bind(&record.content)
        .bind(&record.content_hash)
        .bind(record.version)
        .bind(record.imported_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn supersede(
        tx: &mut Transaction<'_, Postgres>,
        previous: &Record,
        replacement: &NewRecord,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        // 先快照，再取消 latest；任一步未命中说明旧版本已被并发替换
        let snapshot = sqlx::query(
            r#"
            INSERT INTO record_history
                (id, record_id, source_id, natural_key, version, content, content_hash,
                 imported_at, last_updated, superseded_at, superseded_by)
            SELECT $1, id, source_id, natural_key, version, content, content_hash,
                   imported_at, last_updated, $3, $4
            FROM records
            WHERE id = $2 AND is_latest = true
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(previous.id)
        .bind(now)
        .bind(replacement.id)
        .execute(&mut **tx)
        .await?;

        if snapshot.rows_affected() != 1 {
            return Err(AppError::store_conflict(format!(
                "记录 {} 已不是最新版本",
                previous.natural_key
            )));
        }

        let demoted = sqlx::query(
            "UPDATE records SET is_latest = false, last_updated = $2 WHERE id = $1 AND is_latest = true",
        )
        .bind(previous.id)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        if demoted.rows_affected() != 1 {
            return Err(AppError::store_conflict(format!(
                "记录 {} 已不是最新版本",
                previous.natural_key
            )));
        }

        Self::insert(tx, replacement).await
    }
}

#[async_trait::async_trait]
impl RecordStore for RecordRepository {
    async fn find_latest(
        &self,
        source_id: Uuid,
        keys: &[String],
    ) -> AppResult<HashMap<String, Record>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, Record>(
            r#"
            SELECT id, source_id, natural_key, external_id, content, content_hash,
                   version, is_latest, imported_at, last_updated
            FROM records
            WHERE source_id = $1 AND is_latest = true AND natural_key = ANY($2)
            "#,
        )
        .bind(source_id)
        .bind(keys)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|record| (record.natural_key.clone(), record))
            .collect())
    }

    async fn apply_changes(&self, changes: &[RecordChange], now: DateTime<Utc>) -> AppResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.pool().begin().await?;

        for change in changes {
            match change {
                RecordChange::Insert(record) => Self::insert(&mut tx, record).await?,
                RecordChange::Supersede {
                    previous,
                    replacement,
                } => Self::supersede(&mut tx, previous, replacement, now).await?,
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_latest(&self, source_id: Uuid) -> AppResult<Vec<Record>> {
        let rows = sqlx::query_as::<_, Record>(
            r#"
            SELECT id, source_id, natural_key, external_id, content, content_hash,
                   version, is_latest, imported_at, last_updated
            FROM records
            WHERE source_id = $1 AND is_latest = true
            ORDER BY natural_key ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    async fn history(&self, source_id: Uuid, natural_key: &str) -> AppResult<Vec<RecordHistory>> {
        let rows = sqlx::query_as::<_, RecordHistory>(
            r#"
            SELECT id, record_id, source_id, natural_key, version, content, content_hash,
                   imported_at, last_updated, superseded_at, superseded_by
            FROM record_history
            WHERE source_id = $1 AND natural_key = $2
            ORDER BY version ASC
            "#,
        )
        .bind(source_id)
        .bind(natural_key)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }
}
