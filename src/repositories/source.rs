use crate::{
    database::Database,
    error::AppResult,
    models::{CreateSourceRequest, Source},
    repositories::SourceStore,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 数据源仓库
#[derive(Debug, Clone)]
pub struct SourceRepository {
    db: Database,
}

impl SourceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl SourceStore for SourceRepository {
    async fn create(&self, request: &CreateSourceRequest, now: DateTime<Utc>) -> AppResult<Source> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            INSERT INTO sources (id, name, url, collector, is_active, last_collected_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, true, NULL, $5, $5)
            RETURNING id, name, url, collector, is_active, last_collected_at, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.name.trim())
        .bind(&request.url)
        .bind(&request.collector)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        Ok(source)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, name, url, collector, is_active, last_collected_at, created_at, updated_at
            FROM sources
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(source)
    }

    async fn list(&self, active_only: bool) -> AppResult<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            r#"
            SELECT id, name, url, collector, is_active, last_collected_at, created_at, updated_at
            FROM sources
            WHERE ($1 = false OR is_active = true)
            ORDER BY name ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(self.db.pool())
        .await?;

        Ok(sources)
    }

    async fn mark_collected(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE sources SET last_collected_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }
}
