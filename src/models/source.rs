use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// 数据源
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Source {
    pub id: Uuid,
    /// 数据源名称（唯一）
    pub name: String,
    /// 来源地址
    pub url: String,
    /// 采集器注册名，为空时使用数据源名称
    pub collector: Option<String>,
    pub is_active: bool,
    /// 最近一次成功采集时间
    pub last_collected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// 对应的采集器注册名
    pub fn collector_name(&self) -> &str {
        self.collector.as_deref().unwrap_or(&self.name)
    }

    /// 冷却期结束时间；从未采集过则为 None
    pub fn cooldown_until(&self, cooldown: Duration) -> Option<DateTime<Utc>> {
        self.last_collected_at.map(|at| at + cooldown)
    }

    /// 按采集周期判断是否到期
    pub fn is_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_collected_at {
            Some(at) => now - at >= interval,
            None => true,
        }
    }
}

/// 创建数据源请求
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateSourceRequest {
    pub name: String,
    pub url: String,
    pub collector: Option<String>,
}

impl CreateSourceRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("数据源名称不能为空".to_string());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("数据源地址必须以http://或https://开头".to_string());
        }
        if let Some(collector) = &self.collector {
            if collector.trim().is_empty() {
                return Err("采集器名称不能为空字符串".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(last_collected_at: Option<DateTime<Utc>>) -> Source {
        let now = Utc::now();
        Source {
            id: Uuid::new_v4(),
            name: "city-tenders".to_string(),
            url: "https://example.org/tenders".to_string(),
            collector: None,
            is_active: true,
            last_collected_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_collector_name_falls_back_to_source_name() {
        let mut s = source(None);
        assert_eq!(s.collector_name(), "city-tenders");
        s.collector = Some("json_feed".to_string());
        assert_eq!(s.collector_name(), "json_feed");
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(source(None).is_due(now, Duration::hours(24)));
        assert!(!source(Some(now - Duration::hours(1))).is_due(now, Duration::hours(24)));
        assert!(source(Some(now - Duration::hours(25))).is_due(now, Duration::hours(24)));
    }

    #[test]
    fn test_create_request_validation() {
        let req = CreateSourceRequest {
            name: " ".to_string(),
            url: "https://example.org".to_string(),
            collector: None,
        };
        assert!(req.validate().is_err());

        let req = CreateSourceRequest {
            name: "grants".to_string(),
            url: "ftp://example.org".to_string(),
            collector: None,
        };
        assert!(req.validate().is_err());
    }
}
