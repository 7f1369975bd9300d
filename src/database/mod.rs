use crate::{config::DatabaseConfig, error::AppResult};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// 服务依赖的数据表，结构由 sql/schema.sql 维护
const REQUIRED_TABLES: &[&str] = &[
    "sources",
    "job_statuses",
    "source_health",
    "status_checks",
    "records",
    "record_history",
    "job_queue",
];

/// 数据库连接池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

impl Database {
    /// 创建数据库连接池
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        tracing::info!("正在连接数据库: {}", mask_database_url(&config.url));

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        tracing::info!("数据库连接成功，最大连接数: {}", config.max_connections);

        Ok(Self { pool })
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 检查必要的数据表是否存在，返回缺失的表名
    pub async fn missing_tables(&self) -> AppResult<Vec<String>> {
        let existing = sqlx::query_scalar::<_, String>(
            r#"
            SELECT table_name::text FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = ANY($1)
            "#,
        )
        .bind(REQUIRED_TABLES)
        .fetch_all(&self.pool)
        .await?;

        Ok(REQUIRED_TABLES
            .iter()
            .filter(|table| !existing.iter().any(|name| name == *table))
            .map(|table| table.to_string())
            .collect())
    }

    /// 检查数据库健康状态
    pub async fn health_check(&self) -> AppResult<bool> {
        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;

        Ok(result == 1)
    }

    /// 关闭数据库连接池
    pub async fn close(&self) {
        tracing::info!("正在关闭数据库连接池...");
        self.pool.close().await;
        tracing::info!("数据库连接池已关闭");
    }
}

/// 隐藏数据库URL中的敏感信息
pub fn mask_database_url(url: &str) -> String {
    let Some(at_pos) = url.rfind('@') else {
        return url.to_string();
    };
    let Some(protocol_end) = url.find("://") else {
        return url.to_string();
    };
    let credentials_start = protocol_end + 3;
    if credentials_start > at_pos {
        return url.to_string();
    }

    match url[credentials_start..at_pos].find(':') {
        Some(colon_pos) => {
            let mut masked = url.to_string();
            masked.replace_range(credentials_start + colon_pos + 1..at_pos, "***");
            masked
        }
        None => url.to_string(),
    }
}
