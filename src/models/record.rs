use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// 采集器返回的原始记录：无序的字符串键字段表
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// 业务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Record {
    pub id: Uuid,
    pub source_id: Uuid,
    /// 自然键：ext:<外部ID> 或 hash:<组合键摘要>
    pub natural_key: String,
    pub external_id: Option<String>,
    /// 规范化后的业务字段
    pub content: JsonValue,
    pub content_hash: String,
    /// 版本号（从1开始）
    pub version: i32,
    pub is_latest: bool,
    pub imported_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// 待写入的新记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub natural_key: String,
    pub external_id: Option<String>,
    pub content: JsonValue,
    pub content_hash: String,
    pub version: i32,
    pub imported_at: DateTime<Utc>,
}

impl NewRecord {
    /// 写入后对应的记录行
    pub fn into_record(self) -> Record {
        Record {
            id: self.id,
            source_id: self.source_id,
            natural_key: self.natural_key,
            external_id: self.external_id,
            content: self.content,
            content_hash: self.content_hash,
            version: self.version,
            is_latest: true,
            imported_at: self.imported_at,
            last_updated: self.imported_at,
        }
    }
}

/// 记录被替换前的快照（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct RecordHistory {
    pub id: Uuid,
    pub record_id: Uuid,
    pub source_id: Uuid,
    pub natural_key: String,
    pub version: i32,
    pub content: JsonValue,
    pub content_hash: String,
    pub imported_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub superseded_at: DateTime<Utc>,
    /// 替换它的新记录ID
    pub superseded_by: Uuid,
}

/// 一批合并结果中的单条写操作
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// 新自然键，直接插入
    Insert(NewRecord),
    /// 内容变化：快照旧记录、取消其 latest 标记、插入新版本
    Supersede {
        previous: Record,
        replacement: NewRecord,
    },
}

/// 合并统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReconcileStats {
    pub new: u32,
    pub updated: u32,
    pub duplicate: u32,
    pub errored: u32,
}

impl ReconcileStats {
    pub fn total(&self) -> u32 {
        self.new + self.updated + self.duplicate + self.errored
    }
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "新增/更新/重复/错误={}/{}/{}/{}",
            self.new, self.updated, self.duplicate, self.errored
        )
    }
}
