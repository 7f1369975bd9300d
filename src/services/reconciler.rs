use crate::{
    context::AppContext,
    error::{AppError, AppResult},
    models::{NewRecord, RawRecord, ReconcileStats, Record, RecordChange},
    services::normalize::{NormalizedRecord, Normalizer},
};
use std::{collections::HashMap, future::Future};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 记录合并引擎
///
/// 将一次采集得到的原始记录与已存储的 latest 记录比对，产出新增、更新、重复
/// 三类决定。每 `batch_size` 条原始记录提交一次事务，已提交的批次不受后续
/// 批次失败影响。
#[derive(Debug, Clone)]
pub struct Reconciler {
    ctx: AppContext,
    normalizer: Normalizer,
}

impl Reconciler {
    pub fn new(ctx: AppContext) -> Self {
        let normalizer = Normalizer::new(ctx.config.reconcile.clone());
        Self { ctx, normalizer }
    }

    /// 合并一批原始记录
    ///
    /// 批次提交失败时立即返回错误，之前已提交的批次保留；重试时这些记录会被
    /// 识别为重复。
    pub async fn reconcile(&self, source_id: Uuid, rows: &[RawRecord]) -> AppResult<ReconcileStats> {
        self.reconcile_with(source_id, rows, || async { Ok(true) }).await
    }

    /// 合并一批原始记录，每个批次提交前先调用 `before_batch`
    ///
    /// `before_batch` 返回 false 时停止合并并返回存储冲突，后续批次不再写入。
    pub async fn reconcile_with<F, Fut>(
        &self,
        source_id: Uuid,
        rows: &[RawRecord],
        mut before_batch: F,
    ) -> AppResult<ReconcileStats>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<bool>>,
    {
        let batch_size = self.ctx.config.reconcile.batch_size.max(1);
        let mut stats = ReconcileStats::default();

        for (index, batch) in rows.chunks(batch_size).enumerate() {
            if !before_batch().await? {
                warn!(source_id = %source_id, batch = index, "合并中止，已提交部分: {}", stats);
                return Err(AppError::store_conflict(format!(
                    "数据源 {} 的任务已被接管，停止合并",
                    source_id
                )));
            }
            let batch_stats = self.reconcile_batch(source_id, batch).await.inspect_err(|e| {
                warn!(
                    source_id = %source_id,
                    batch = index,
                    "批次提交失败，已提交部分: {}，错误: {}",
                    stats,
                    e
                );
            })?;
            debug!(source_id = %source_id, batch = index, "批次已提交: {}", batch_stats);
            stats.new += batch_stats.new;
            stats.updated += batch_stats.updated;
            stats.duplicate += batch_stats.duplicate;
            stats.errored += batch_stats.errored;
        }

        info!(source_id = %source_id, total = rows.len(), "记录合并完成: {}", stats);
        Ok(stats)
    }

    async fn reconcile_batch(&self, source_id: Uuid, batch: &[RawRecord]) -> AppResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let mut normalized = Vec::with_capacity(batch.len());

        for raw in batch {
            match self.normalizer.normalize(raw) {
                Ok(record) => normalized.push(record),
                Err(e) => {
                    warn!(source_id = %source_id, "记录规范化失败，跳过: {}", e);
                    stats.errored += 1;
                }
            }
        }

        let mut keys: Vec<String> = normalized.iter().map(|r| r.natural_key.clone()).collect();
        keys.sort();
        keys.dedup();

        // 本批次内的写入对后续行可见
        let mut latest: HashMap<String, Record> =
            self.ctx.records.find_latest(source_id, &keys).await?;
        let now = self.ctx.now();
        let mut changes = Vec::new();

        for record in normalized {
            match latest.get(&record.natural_key).cloned() {
                Some(current) if current.content_hash == record.content_hash => {
                    stats.duplicate += 1;
                }
                Some(current) => {
                    let replacement = new_record(source_id, record, current.version + 1, now);
                    latest.insert(replacement.natural_key.clone(), replacement.clone().into_record());
                    changes.push(RecordChange::Supersede {
                        previous: current,
                        replacement,
                    });
                    stats.updated += 1;
                }
                None => {
                    let inserted = new_record(source_id, record, 1, now);
                    latest.insert(inserted.natural_key.clone(), inserted.clone().into_record());
                    changes.push(RecordChange::Insert(inserted));
                    stats.new += 1;
                }
            }
        }

        self.ctx.records.apply_changes(&changes, now).await?;
        Ok(stats)
    }
}

fn new_record(
    source_id: Uuid,
    record: NormalizedRecord,
    version: i32,
    now: chrono::DateTime<chrono::Utc>,
) -> NewRecord {
    NewRecord {
        id: Uuid::new_v4(),
        source_id,
        natural_key: record.natural_key,
        external_id: record.external_id,
        content: record.content,
        content_hash: record.content_hash,
        version,
        imported_at: now,
    }
}
