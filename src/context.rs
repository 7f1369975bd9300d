use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    database::Database,
    repositories::{
        JobQueue, JobQueueRepository, JobStatusRepository, MemoryStore, RecordRepository,
        RecordStore, SourceRepository, SourceStore, StatusStore,
    },
};
use std::sync::Arc;

/// 服务共享的依赖：存储、时钟与配置
#[derive(Clone)]
pub struct AppContext {
    pub sources: Arc<dyn SourceStore>,
    pub statuses: Arc<dyn StatusStore>,
    pub records: Arc<dyn RecordStore>,
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    /// 数据库模式下的连接池，无数据库模式为 None
    pub database: Option<Database>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("database", &self.database)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// PostgreSQL 存储
    pub fn postgres(db: Database, config: Config) -> Self {
        Self {
            sources: Arc::new(SourceRepository::new(db.clone())),
            statuses: Arc::new(JobStatusRepository::new(db.clone())),
            records: Arc::new(RecordRepository::new(db.clone())),
            queue: Arc::new(JobQueueRepository::new(db.clone())),
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
            database: Some(db),
        }
    }

    /// 内存存储（无数据库模式）
    pub fn in_memory(config: Config) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), Arc::new(SystemClock), config)
    }

    /// 使用给定的内存存储与时钟
    pub fn with_store(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            sources: store.clone(),
            statuses: store.clone(),
            records: store.clone(),
            queue: store,
            clock,
            config: Arc::new(config),
            database: None,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// running 状态的僵死阈值
    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.status.stale_threshold_secs as i64)
    }
}
