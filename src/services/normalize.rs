//! 原始记录规范化与自然键推导
//!
//! 所有文本去除首尾空白并把连续空白折叠为单个空格（存储与比较都使用规范化后的值），
//! 大小写与标点保持原样。

use crate::{config::ReconcileConfig, models::RawRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// 组合键各字段之间的分隔符（ASCII 单元分隔符）
const KEY_SEPARATOR: char = '\u{1f}';

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"];

/// 单条记录的规范化错误，计入 errored 后继续处理
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("字段 {0} 包含嵌套结构")]
    NestedValue(String),

    #[error("字段 {field} 的金额无法解析: {value}")]
    InvalidCurrency { field: String, value: String },

    #[error("缺少外部ID且组合键字段全部为空")]
    MissingKey,
}

/// 规范化后的记录
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub natural_key: String,
    pub external_id: Option<String>,
    /// 业务字段（已剔除忽略字段）
    pub content: JsonValue,
    pub content_hash: String,
}

/// 记录规范化器
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: ReconcileConfig,
}

impl Normalizer {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    /// 规范化一条原始记录并推导自然键
    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, RowError> {
        let mut content = Map::new();

        for (field, value) in raw {
            if self.is_ignored(field) {
                continue;
            }
            let normalized = self.normalize_field(field, value)?;
            content.insert(field.clone(), normalized);
        }

        let external_id = content
            .get(&self.config.external_id_field)
            .and_then(key_component);
        let natural_key = match &external_id {
            Some(id) => format!("ext:{id}"),
            None => self.composite_key(&content)?,
        };

        let content_hash = sha256_hex(canonical_json(&content).as_bytes());
        let content = JsonValue::Object(content);

        Ok(NormalizedRecord {
            natural_key,
            external_id,
            content,
            content_hash,
        })
    }

    fn is_ignored(&self, field: &str) -> bool {
        self.config
            .ignored_fields
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(field))
    }

    fn is_date_field(&self, field: &str) -> bool {
        let field = field.to_lowercase();
        self.config.date_fields.iter().any(|name| *name == field)
            || self
                .config
                .date_suffixes
                .iter()
                .any(|suffix| field.ends_with(suffix.as_str()))
    }

    fn is_currency_field(&self, field: &str) -> bool {
        let field = field.to_lowercase();
        self.config.currency_fields.iter().any(|name| *name == field)
            || self
                .config
                .currency_suffixes
                .iter()
                .any(|suffix| field.ends_with(suffix.as_str()))
    }

    fn normalize_field(&self, field: &str, value: &JsonValue) -> Result<JsonValue, RowError> {
        match value {
            JsonValue::Array(_) | JsonValue::Object(_) => {
                Err(RowError::NestedValue(field.to_string()))
            }
            JsonValue::Null | JsonValue::Bool(_) => Ok(value.clone()),
            JsonValue::Number(number) => {
                if self.is_currency_field(field) {
                    Ok(number.as_f64().map(currency_value).unwrap_or(JsonValue::Null))
                } else {
                    Ok(value.clone())
                }
            }
            JsonValue::String(text) => {
                let text = normalize_text(text);
                if text.is_empty() {
                    return Ok(JsonValue::Null);
                }
                if self.is_currency_field(field) {
                    return parse_currency(&text).map(currency_value).ok_or_else(|| {
                        RowError::InvalidCurrency {
                            field: field.to_string(),
                            value: text,
                        }
                    });
                }
                if self.is_date_field(field) {
                    return Ok(JsonValue::String(normalize_date(&text).unwrap_or(text)));
                }
                Ok(JsonValue::String(text))
            }
        }
    }

    fn composite_key(&self, content: &Map<String, JsonValue>) -> Result<String, RowError> {
        let components: Vec<Option<String>> = self
            .config
            .composite_key_fields
            .iter()
            .map(|field| content.get(field).and_then(key_component))
            .collect();

        if components.iter().all(Option::is_none) {
            return Err(RowError::MissingKey);
        }

        let joined = components
            .into_iter()
            .map(|component| component.unwrap_or_default().to_lowercase())
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());

        Ok(format!("hash:{}", sha256_hex(joined.as_bytes())))
    }
}

/// 去除首尾空白并折叠内部连续空白
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 识别常见日期格式；含时间的输出 RFC 3339 UTC，否则输出 YYYY-MM-DD
pub fn normalize_date(text: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// 解析金额文本，支持货币符号、千分位以及逗号小数点
pub fn parse_currency(text: &str) -> Option<f64> {
    let mut cleaned = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '0'..='9' | '.' | ',' | '-' => cleaned.push(c),
            c if c.is_whitespace() || c == '\'' || c == '_' => {}
            c if c.is_alphabetic() || is_currency_symbol(c) => {}
            _ => return None,
        }
    }
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let canonical = match (last_dot, last_comma) {
        // 两者都有：靠后的是小数点
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // 只有逗号：恰好两位小数时视为小数点，否则为千分位
        (None, Some(comma)) if cleaned.matches(',').count() == 1 && cleaned.len() - comma - 1 == 2 => {
            cleaned.replace(',', ".")
        }
        (None, Some(_)) => cleaned.replace(',', ""),
        // 多个点只能是千分位
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    canonical.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn is_currency_symbol(c: char) -> bool {
    matches!(c, '$' | '€' | '£' | '¥' | '₹' | '₽' | '₩' | '₺' | '₴' | '¢')
}

/// 金额统一为浮点数，整数 100 与 100.0 比较相等
fn currency_value(value: f64) -> JsonValue {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// 可用作键的字段值：非空文本或数字
fn key_component(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 按键排序后的紧凑 JSON，作为内容摘要的输入
fn canonical_json(content: &Map<String, JsonValue>) -> String {
    let sorted: BTreeMap<&String, &JsonValue> = content.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(ReconcileConfig::default())
    }

    #[test]
    fn test_text_is_trimmed_and_collapsed() {
        assert_eq!(normalize_text("  Road \t works\n phase  2 "), "Road works phase 2");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_external_id_key_and_empty_strings() {
        let record = normalizer()
            .normalize(&raw(json!({
                "external_id": " 42 ",
                "title": "  Bridge   repair ",
                "notes": "   ",
            })))
            .unwrap();

        assert_eq!(record.natural_key, "ext:42");
        assert_eq!(record.external_id.as_deref(), Some("42"));
        assert_eq!(record.content["title"], json!("Bridge repair"));
        assert_eq!(record.content["notes"], JsonValue::Null);
    }

    #[test]
    fn test_numeric_external_id() {
        let record = normalizer()
            .normalize(&raw(json!({ "external_id": 7, "title": "x" })))
            .unwrap();
        assert_eq!(record.natural_key, "ext:7");
    }

    #[test]
    fn test_composite_key_ignores_case_and_whitespace() {
        let n = normalizer();
        let a = n
            .normalize(&raw(json!({ "title": "Road Works", "agency": "City  Council" })))
            .unwrap();
        let b = n
            .normalize(&raw(json!({ "title": " road works", "agency": "CITY COUNCIL" })))
            .unwrap();
        assert!(a.natural_key.starts_with("hash:"));
        assert_eq!(a.natural_key, b.natural_key);
    }

    #[test]
    fn test_missing_key_is_row_error() {
        let err = normalizer()
            .normalize(&raw(json!({ "description": "no identity" })))
            .unwrap_err();
        assert_eq!(err, RowError::MissingKey);
    }

    #[test]
    fn test_nested_value_is_row_error() {
        let err = normalizer()
            .normalize(&raw(json!({ "external_id": "1", "lots": [1, 2] })))
            .unwrap_err();
        assert_eq!(err, RowError::NestedValue("lots".to_string()));
    }

    #[test]
    fn test_currency_values() {
        assert_eq!(parse_currency("$1,234.50"), Some(1234.5));
        assert_eq!(parse_currency("1.234,50 €"), Some(1234.5));
        assert_eq!(parse_currency("12,50"), Some(12.5));
        assert_eq!(parse_currency("1,000,000"), Some(1_000_000.0));
        assert_eq!(parse_currency("R$ 2.500.000"), Some(2_500_000.0));
        assert_eq!(parse_currency("n/a"), None);

        let n = normalizer();
        let int = n
            .normalize(&raw(json!({ "external_id": "1", "value": 100 })))
            .unwrap();
        let text = n
            .normalize(&raw(json!({ "external_id": "1", "value": "100.00" })))
            .unwrap();
        assert_eq!(int.content, text.content);
        assert_eq!(int.content_hash, text.content_hash);

        let err = n
            .normalize(&raw(json!({ "external_id": "1", "contract_value": "TBD!" })))
            .unwrap_err();
        assert!(matches!(err, RowError::InvalidCurrency { .. }));
    }

    #[test]
    fn test_date_values() {
        assert_eq!(normalize_date("2024-03-05").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("05/03/2024").as_deref(), Some("2024-03-05"));
        assert_eq!(
            normalize_date("2024-03-05T10:30:00+02:00").as_deref(),
            Some("2024-03-05T08:30:00Z")
        );
        assert_eq!(
            normalize_date("2024-03-05 10:30").as_deref(),
            Some("2024-03-05T10:30:00Z")
        );
        assert_eq!(normalize_date("next week"), None);

        let record = normalizer()
            .normalize(&raw(json!({
                "external_id": "1",
                "closing_date": "05.03.2024",
                "deadline": "soon",
            })))
            .unwrap();
        assert_eq!(record.content["closing_date"], json!("2024-03-05"));
        assert_eq!(record.content["deadline"], json!("soon"));
    }

    #[test]
    fn test_ignored_fields_do_not_affect_hash() {
        let n = normalizer();
        let a = n
            .normalize(&raw(json!({ "external_id": "1", "title": "Foo", "scraped_at": "2024-01-01" })))
            .unwrap();
        let b = n
            .normalize(&raw(json!({ "external_id": "1", "title": "Foo", "scraped_at": "2024-02-01" })))
            .unwrap();
        assert!(a.content.get("scraped_at").is_none());
        assert_eq!(a.content_hash, b.content_hash);
    }
}
