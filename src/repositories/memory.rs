//! 内存存储
//!
//! 无数据库模式与单元测试使用。所有状态放在一把锁后面，每个方法在持锁期间
//! 完成检查与写入，提供与 PostgreSQL 条件写入相同的原子性。

use crate::{
    error::{AppError, AppResult},
    models::{
        CreateSourceRequest, JobState, JobStatus, JobTicket, NewRecord, NewStatusCheck, Record,
        RecordChange, RecordHistory, Source, SourceHealth, StatusCheck, TransitionOutcome,
    },
    repositories::{JobQueue, RecordStore, SourceStore, StatusStore},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    sources: HashMap<Uuid, Source>,
    statuses: HashMap<Uuid, JobStatus>,
    health: HashMap<Uuid, SourceHealth>,
    checks: Vec<StatusCheck>,
    next_check_id: i64,
    records: Vec<Record>,
    history: Vec<RecordHistory>,
    queue: Vec<JobTicket>,
    #[cfg(test)]
    fail_batches_after: Option<usize>,
    #[cfg(test)]
    applied_batches: usize,
}

/// 内存存储，实现全部存储接口
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 成功提交 `n` 批之后，后续批次提交失败
    #[cfg(test)]
    pub async fn fail_batches_after(&self, n: usize) {
        let mut state = self.state.lock().await;
        state.fail_batches_after = Some(n);
        state.applied_batches = 0;
    }

    /// 直接写入状态行，测试用
    #[cfg(test)]
    pub async fn put_status(&self, status: JobStatus) {
        self.state
            .lock()
            .await
            .statuses
            .insert(status.source_id, status);
    }
}

impl MemoryState {
    fn running_mut(&mut self, source_id: Uuid, correlation_id: Uuid) -> Option<&mut JobStatus> {
        self.statuses.get_mut(&source_id).filter(|status| {
            status.state == JobState::Running && status.correlation_id == Some(correlation_id)
        })
    }

    fn stage_insert(records: &mut Vec<Record>, new: &NewRecord) -> AppResult<()> {
        let duplicate = records.iter().any(|record| {
            record.source_id == new.source_id
                && record.natural_key == new.natural_key
                && record.is_latest
        });
        if duplicate {
            return Err(AppError::store_conflict(format!(
                "自然键 {} 已存在最新记录",
                new.natural_key
            )));
        }
        records.push(new.clone().into_record());
        Ok(())
    }
}

#[async_trait::async_trait]
impl SourceStore for MemoryStore {
    async fn create(&self, request: &CreateSourceRequest, now: DateTime<Utc>) -> AppResult<Source> {
        let mut state = self.state.lock().await;
        let name = request.name.trim();
        if state.sources.values().any(|source| source.name == name) {
            return Err(AppError::bad_request(format!("数据源名称已存在: {}", name)));
        }

        let source = Source {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: request.url.clone(),
            collector: request.collector.clone(),
            is_active: true,
            last_collected_at: None,
            created_at: now,
            updated_at: now,
        };
        state.sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Source>> {
        Ok(self.state.lock().await.sources.get(&id).cloned())
    }

    async fn list(&self, active_only: bool) -> AppResult<Vec<Source>> {
        let state = self.state.lock().await;
        let mut sources: Vec<Source> = state
            .sources
            .values()
            .filter(|source| !active_only || source.is_active)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn mark_collected(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(source) = self.state.lock().await.sources.get_mut(&id) {
            source.last_collected_at = Some(at);
            source.updated_at = at;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusStore for MemoryStore {
    async fn get(&self, source_id: Uuid) -> AppResult<Option<JobStatus>> {
        Ok(self.state.lock().await.statuses.get(&source_id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<JobStatus>> {
        let state = self.state.lock().await;
        let mut statuses: Vec<JobStatus> = state.statuses.values().cloned().collect();
        statuses.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(statuses)
    }

    async fn try_transition_to_running(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> AppResult<TransitionOutcome> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.statuses.get(&source_id) {
            let live = current.state == JobState::Running
                && current.last_checked_at.is_some_and(|at| at >= stale_before);
            if live {
                return Ok(TransitionOutcome::AlreadyRunning(current.clone()));
            }
        }

        let status = JobStatus {
            source_id,
            state: JobState::Running,
            correlation_id: Some(correlation_id),
            attempt: 1,
            last_checked_at: Some(now),
            started_at: Some(now),
            error_message: None,
            response_time_ms: None,
            updated_at: now,
        };
        state.statuses.insert(source_id, status.clone());
        Ok(TransitionOutcome::Acquired(status))
    }

    async fn heartbeat(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.running_mut(source_id, correlation_id) {
            Some(status) => {
                status.last_checked_at = Some(now);
                status.attempt = attempt;
                status.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn complete(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        response_time_ms: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.running_mut(source_id, correlation_id) {
            Some(status) => {
                status.state = JobState::Completed;
                status.last_checked_at = Some(now);
                status.error_message = None;
                status.response_time_ms = Some(response_time_ms);
                status.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn fail(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.running_mut(source_id, correlation_id) {
            Some(status) => {
                status.state = JobState::Error;
                status.last_checked_at = Some(now);
                status.error_message = Some(message.to_string());
                status.updated_at = now;
                true
            }
            None => false,
        })
    }

    async fn sweep_stale(
        &self,
        stale_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<JobStatus>> {
        let mut state = self.state.lock().await;
        let mut swept = Vec::new();
        for status in state.statuses.values_mut() {
            let stale = status.state == JobState::Running
                && status.last_checked_at.is_none_or(|at| at < stale_before);
            if stale {
                status.state = JobState::Error;
                status.error_message = Some(message.to_string());
                status.updated_at = now;
                swept.push(status.clone());
            }
        }
        Ok(swept)
    }

    async fn record_health(&self, health: &SourceHealth) -> AppResult<()> {
        self.state
            .lock()
            .await
            .health
            .insert(health.source_id, health.clone());
        Ok(())
    }

    async fn get_health(&self, source_id: Uuid) -> AppResult<Option<SourceHealth>> {
        Ok(self.state.lock().await.health.get(&source_id).cloned())
    }

    async fn list_health(&self) -> AppResult<Vec<SourceHealth>> {
        let state = self.state.lock().await;
        let mut rows: Vec<SourceHealth> = state.health.values().cloned().collect();
        rows.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        Ok(rows)
    }

    async fn append_check(&self, check: &NewStatusCheck) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.next_check_id += 1;
        let id = state.next_check_id;
        state.checks.push(StatusCheck {
            id,
            source_id: check.source_id,
            kind: check.kind.to_string(),
            outcome: check.outcome.clone(),
            correlation_id: check.correlation_id,
            response_time_ms: check.response_time_ms,
            message: check.message.clone(),
            checked_at: check.checked_at,
        });
        Ok(())
    }

    async fn recent_checks(&self, source_id: Uuid, limit: i64) -> AppResult<Vec<StatusCheck>> {
        let state = self.state.lock().await;
        let mut checks: Vec<StatusCheck> = state
            .checks
            .iter()
            .filter(|check| check.source_id == source_id)
            .cloned()
            .collect();
        checks.sort_by(|a, b| b.checked_at.cmp(&a.checked_at).then(b.id.cmp(&a.id)));
        checks.truncate(limit.max(0) as usize);
        Ok(checks)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn find_latest(
        &self,
        source_id: Uuid,
        keys: &[String],
    ) -> AppResult<HashMap<String, Record>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|record| {
                record.source_id == source_id && record.is_latest && keys.contains(&record.natural_key)
            })
            .map(|record| (record.natural_key.clone(), record.clone()))
            .collect())
    }

    async fn apply_changes(&self, changes: &[RecordChange], now: DateTime<Utc>) -> AppResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        #[cfg(test)]
        {
            if let Some(limit) = state.fail_batches_after {
                if state.applied_batches >= limit {
                    return Err(AppError::Database(sqlx::Error::PoolTimedOut));
                }
            }
        }

        // 在副本上应用，全部成功才替换，等价于事务回滚
        let mut records = state.records.clone();
        let mut history = state.history.clone();

        for change in changes {
            match change {
                RecordChange::Insert(new) => MemoryState::stage_insert(&mut records, new)?,
                RecordChange::Supersede {
                    previous,
                    replacement,
                } => {
                    let current = records
                        .iter_mut()
                        .find(|record| record.id == previous.id && record.is_latest)
                        .ok_or_else(|| {
                            AppError::store_conflict(format!(
                                "记录 {} 已不是最新版本",
                                previous.natural_key
                            ))
                        })?;

                    history.push(RecordHistory {
                        id: Uuid::new_v4(),
                        record_id: current.id,
                        source_id: current.source_id,
                        natural_key: current.natural_key.clone(),
                        version: current.version,
                        content: current.content.clone(),
                        content_hash: current.content_hash.clone(),
                        imported_at: current.imported_at,
                        last_updated: current.last_updated,
                        superseded_at: now,
                        superseded_by: replacement.id,
                    });
                    current.is_latest = false;
                    current.last_updated = now;

                    MemoryState::stage_insert(&mut records, replacement)?;
                }
            }
        }

        state.records = records;
        state.history = history;
        #[cfg(test)]
        {
            state.applied_batches += 1;
        }
        Ok(())
    }

    async fn list_latest(&self, source_id: Uuid) -> AppResult<Vec<Record>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Record> = state
            .records
            .iter()
            .filter(|record| record.source_id == source_id && record.is_latest)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(rows)
    }

    async fn history(&self, source_id: Uuid, natural_key: &str) -> AppResult<Vec<RecordHistory>> {
        let state = self.state.lock().await;
        let mut rows: Vec<RecordHistory> = state
            .history
            .iter()
            .filter(|row| row.source_id == source_id && row.natural_key == natural_key)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.version);
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, ticket: &JobTicket) -> AppResult<()> {
        self.state.lock().await.queue.push(ticket.clone());
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> AppResult<Option<JobTicket>> {
        let mut state = self.state.lock().await;
        let next = state
            .queue
            .iter()
            .enumerate()
            .filter(|(_, ticket)| ticket.available_at <= now)
            .min_by_key(|(_, ticket)| (ticket.available_at, ticket.enqueued_at))
            .map(|(index, _)| index);

        Ok(next.map(|index| state.queue.remove(index)))
    }

    async fn len(&self) -> AppResult<i64> {
        Ok(self.state.lock().await.queue.len() as i64)
    }
}
