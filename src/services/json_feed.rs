use crate::{
    error::{AppError, AppResult, CollectorError},
    models::{RawRecord, Source},
    services::collector::Collector,
};
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// 通用 JSON 采集器：GET 数据源地址，期望返回对象数组
///
/// 也接受 `{"data": [...]}` / `{"items": [...]}` 形式的包装。
#[derive(Debug, Clone)]
pub struct JsonFeedCollector {
    http: Client,
}

impl JsonFeedCollector {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::config(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Collector for JsonFeedCollector {
    async fn collect(&self, source: &Source) -> Result<Vec<RawRecord>, CollectorError> {
        let resp = self
            .http
            .get(&source.url)
            .send()
            .await?
            .error_for_status()?;
        let body: JsonValue = resp.json().await?;
        let rows = parse_feed(body)?;
        debug!(source = %source.name, count = rows.len(), "JSON采集完成");
        Ok(rows)
    }
}

/// 将响应体拆分为原始记录
pub fn parse_feed(body: JsonValue) -> Result<Vec<RawRecord>, CollectorError> {
    let items = match body {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("data").or_else(|| map.remove("items")) {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(CollectorError::Structure(
                    "响应对象中缺少 data/items 数组".to_string(),
                ));
            }
        },
        other => {
            return Err(CollectorError::Structure(format!(
                "响应不是JSON数组: {}",
                type_name(&other)
            )));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            JsonValue::Object(map) => Ok(map),
            other => Err(CollectorError::Structure(format!(
                "第 {} 条记录不是对象: {}",
                index,
                type_name(&other)
            ))),
        })
        .collect()
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
