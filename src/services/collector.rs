use crate::{
    config::CollectorEntry,
    error::{AppError, AppResult, CollectorError},
    models::{RawRecord, Source},
    services::json_feed::JsonFeedCollector,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::info;

/// 采集器接口
///
/// 站点相关的翻页与字段映射逻辑实现在采集器内部。返回的记录可能重复或不完整，
/// 由合并引擎负责去重与校验。
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, source: &Source) -> Result<Vec<RawRecord>, CollectorError>;
}

/// 采集器注册表：名称 -> 采集器，启动时构建后只读
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.collectors.keys().collect();
        names.sort();
        f.debug_struct("CollectorRegistry")
            .field("collectors", &names)
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置构建注册表
    pub fn from_config(entries: &[CollectorEntry]) -> AppResult<Self> {
        let mut registry = Self::new();
        for entry in entries {
            let collector: Arc<dyn Collector> = match entry.kind.as_str() {
                "json_feed" => Arc::new(JsonFeedCollector::new(Duration::from_secs(
                    entry.request_timeout_secs.unwrap_or(30),
                ))?),
                other => {
                    return Err(AppError::config(format!(
                        "采集器 {} 的类型未知: {}",
                        entry.name, other
                    )));
                }
            };
            registry.register(&entry.name, collector);
            info!("已注册采集器: {} ({})", entry.name, entry.kind);
        }
        info!("采集器注册表构建完成，共 {} 个", registry.collectors.len());
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, collector: Arc<dyn Collector>) {
        self.collectors.insert(name.to_string(), collector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(name).cloned()
    }
}
