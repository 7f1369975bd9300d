use crate::{
    config::RetryDecision,
    context::AppContext,
    error::{AppError, AppResult, FailureKind},
    models::{JobTicket, ReconcileStats, Source},
    services::{
        collector::{Collector, CollectorRegistry},
        reconciler::Reconciler,
        status_tracker::StatusTracker,
    },
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// 采集与合并完成，状态已写为 completed
    Completed(ReconcileStats),
    /// 已按退避时间重新入队
    Retrying { next_attempt: i32, delay: Duration },
    /// 放弃，状态已写为 error
    Failed(String),
    /// 该任务已不再持有状态（被新任务接管或已终止），丢弃
    Dropped,
}

/// 一次尝试中的失败
#[derive(Debug)]
struct AttemptFailure {
    kind: FailureKind,
    message: String,
}

impl AttemptFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<AppError> for AttemptFailure {
    fn from(e: AppError) -> Self {
        Self::new(e.failure_kind(), e.to_string())
    }
}

/// 任务执行器
///
/// 固定数量的 worker 从持久化队列领取任务。重试通过带延迟的重新入队实现，
/// 退避期间不占用 worker。
#[derive(Debug, Clone)]
pub struct Executor {
    ctx: AppContext,
    tracker: StatusTracker,
    reconciler: Reconciler,
    registry: Arc<CollectorRegistry>,
}

impl Executor {
    pub fn new(ctx: AppContext, registry: Arc<CollectorRegistry>) -> Self {
        Self {
            tracker: StatusTracker::new(ctx.clone()),
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
            registry,
        }
    }

    /// 启动 worker
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.ctx.config.executor.workers;
        info!("启动 {} 个采集 worker", workers);
        (0..workers)
            .map(|worker_id| {
                let executor = Arc::clone(self);
                tokio::spawn(async move { executor.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: u32) {
        let idle = Duration::from_millis(self.ctx.config.executor.poll_interval_ms);
        loop {
            match self.run_next().await {
                Ok(Some(outcome)) => {
                    debug!(worker_id, ?outcome, "任务尝试结束");
                }
                Ok(None) => sleep(idle).await,
                Err(e) => {
                    error!(worker_id, error = %e, "任务执行失败");
                    sleep(idle).await;
                }
            }
        }
    }

    /// 领取并执行一个到期任务；队列为空时返回 None
    pub async fn run_next(&self) -> AppResult<Option<AttemptOutcome>> {
        match self.ctx.queue.claim_next(self.ctx.now()).await? {
            Some(ticket) => self.execute_attempt(ticket).await.map(Some),
            None => Ok(None),
        }
    }

    /// 执行一次尝试
    pub async fn execute_attempt(&self, ticket: JobTicket) -> AppResult<AttemptOutcome> {
        let JobTicket {
            source_id,
            correlation_id,
            attempt,
            ..
        } = ticket;

        if ticket.is_expired(self.ctx.now()) {
            return self.give_up(&ticket, &timeout_message(&ticket)).await;
        }

        // 确认该任务仍持有状态，同时刷新心跳
        match self.tracker.heartbeat(source_id, correlation_id, attempt).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    source_id = %source_id,
                    correlation_id = %correlation_id,
                    attempt,
                    "任务已不再持有状态，丢弃"
                );
                return Ok(AttemptOutcome::Dropped);
            }
            Err(e) => return self.handle_failure(&ticket, e.into()).await,
        }

        info!(source_id = %source_id, correlation_id = %correlation_id, attempt, "开始采集");
        let started = std::time::Instant::now();

        match self.collect_and_reconcile(&ticket).await {
            Ok(stats) => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                let summary = stats.to_string();
                let accepted = match self
                    .tracker
                    .complete(source_id, correlation_id, elapsed_ms, &summary)
                    .await
                {
                    Ok(accepted) => accepted,
                    // 记录已提交，重试时会识别为重复
                    Err(e) => return self.handle_failure(&ticket, e.into()).await,
                };
                if accepted {
                    if let Err(e) = self.ctx.sources.mark_collected(source_id, self.ctx.now()).await {
                        warn!(source_id = %source_id, error = %e, "更新最近采集时间失败");
                    }
                    info!(
                        source_id = %source_id,
                        correlation_id = %correlation_id,
                        elapsed_ms,
                        "采集完成: {}",
                        summary
                    );
                    Ok(AttemptOutcome::Completed(stats))
                } else {
                    Ok(AttemptOutcome::Dropped)
                }
            }
            Err(failure) => self.handle_failure(&ticket, failure).await,
        }
    }

    async fn collect_and_reconcile(&self, ticket: &JobTicket) -> Result<ReconcileStats, AttemptFailure> {
        let source = self
            .ctx
            .sources
            .get(ticket.source_id)
            .await?
            .ok_or_else(|| AttemptFailure::new(FailureKind::Unexpected, "数据源不存在"))?;

        let collector = self.registry.get(source.collector_name()).ok_or_else(|| {
            AttemptFailure::new(
                FailureKind::Unexpected,
                format!("未注册的采集器: {}", source.collector_name()),
            )
        })?;

        let remaining = (ticket.deadline - self.ctx.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        // 硬截止：即使底层 I/O 无法中断也按超时处理
        let rows = match tokio::time::timeout(
            remaining,
            self.with_heartbeat(ticket, collect(collector, &source)),
        )
        .await
        {
            Ok(result) => result.map_err(|e| AttemptFailure::new(e.kind(), e.to_string()))?,
            Err(_) => {
                return Err(AttemptFailure::new(
                    FailureKind::Timeout,
                    timeout_message(ticket),
                ));
            }
        };

        debug!(source_id = %ticket.source_id, count = rows.len(), "采集返回记录");

        // 每个批次提交前确认仍持有状态并刷新心跳
        let tracker = &self.tracker;
        let (source_id, correlation_id, attempt) =
            (ticket.source_id, ticket.correlation_id, ticket.attempt);
        let reconcile = self
            .reconciler
            .reconcile_with(source_id, &rows, move || {
                tracker.heartbeat(source_id, correlation_id, attempt)
            });
        Ok(self.with_heartbeat(ticket, reconcile).await?)
    }

    /// 运行期间按阈值的三分之一刷新心跳
    async fn with_heartbeat<F: Future>(&self, ticket: &JobTicket, work: F) -> F::Output {
        let period = Duration::from_secs((self.ctx.config.status.stale_threshold_secs / 3).max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    match self.tracker.heartbeat(ticket.source_id, ticket.correlation_id, ticket.attempt).await {
                        Ok(true) => {}
                        Ok(false) => debug!(source_id = %ticket.source_id, "心跳未命中，任务可能已被接管"),
                        Err(e) => warn!(source_id = %ticket.source_id, error = %e, "刷新心跳失败"),
                    }
                }
            }
        }
    }

    async fn handle_failure(&self, ticket: &JobTicket, failure: AttemptFailure) -> AppResult<AttemptOutcome> {
        warn!(
            source_id = %ticket.source_id,
            correlation_id = %ticket.correlation_id,
            attempt = ticket.attempt,
            kind = %failure.kind,
            "采集失败: {}",
            failure.message
        );

        let now = self.ctx.now();
        if failure.kind == FailureKind::Timeout || ticket.is_expired(now) {
            return self.give_up(ticket, &timeout_message(ticket)).await;
        }

        let attempt = u32::try_from(ticket.attempt).unwrap_or(u32::MAX);
        match self.ctx.config.executor.retry.decide(failure.kind, attempt) {
            RetryDecision::RetryAfter(delay) => {
                let available_at = now
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                if available_at >= ticket.deadline {
                    return self.give_up(ticket, &timeout_message(ticket)).await;
                }

                let next = ticket.next_attempt(now, available_at);
                match self
                    .tracker
                    .heartbeat(next.source_id, next.correlation_id, next.attempt)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => return Ok(AttemptOutcome::Dropped),
                    // 下一次尝试开始时会重新确认归属
                    Err(e) => warn!(source_id = %ticket.source_id, error = %e, "重试前刷新心跳失败"),
                }
                if let Err(e) = self.ctx.queue.enqueue(&next).await {
                    let message = format!("重试入队失败: {}", e);
                    return self.give_up(ticket, &message).await;
                }

                info!(
                    source_id = %ticket.source_id,
                    correlation_id = %ticket.correlation_id,
                    next_attempt = next.attempt,
                    "将在 {:?} 后重试",
                    delay
                );
                Ok(AttemptOutcome::Retrying {
                    next_attempt: next.attempt,
                    delay,
                })
            }
            RetryDecision::GiveUp(reason) => {
                let message = format!("{} ({})", failure.message, reason);
                self.give_up(ticket, &message).await
            }
        }
    }

    async fn give_up(&self, ticket: &JobTicket, message: &str) -> AppResult<AttemptOutcome> {
        if self
            .tracker
            .fail(ticket.source_id, ticket.correlation_id, message)
            .await?
        {
            error!(
                source_id = %ticket.source_id,
                correlation_id = %ticket.correlation_id,
                attempt = ticket.attempt,
                "任务失败: {}",
                message
            );
            Ok(AttemptOutcome::Failed(message.to_string()))
        } else {
            Ok(AttemptOutcome::Dropped)
        }
    }
}

async fn collect(
    collector: Arc<dyn Collector>,
    source: &Source,
) -> Result<Vec<crate::models::RawRecord>, crate::error::CollectorError> {
    collector.collect(source).await
}

fn timeout_message(ticket: &JobTicket) -> String {
    format!(
        "任务超时: 超过截止时间 {}",
        ticket.deadline.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// 由关联ID和起始时间构造首个任务
pub fn first_ticket(ctx: &AppContext, source_id: Uuid, correlation_id: Uuid) -> JobTicket {
    let now = ctx.now();
    let deadline = now + chrono::Duration::seconds(ctx.config.executor.job_timeout_secs as i64);
    JobTicket::first(source_id, correlation_id, now, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        config::Config,
        error::CollectorError,
        models::{
            CreateSourceRequest, JobState, JobStatus, NewStatusCheck, RawRecord, Record,
            RecordChange, RecordHistory, SourceHealth, StatusCheck, TransitionOutcome,
        },
        repositories::{MemoryStore, RecordStore, SourceStore, StatusStore},
        services::scheduler::{ScheduleOutcome, Scheduler, SkipReason},
    };
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{
            Mutex, OnceLock,
            atomic::{AtomicU32, Ordering},
        },
    };

    /// 按预设结果返回的采集器
    struct FakeCollector {
        calls: AtomicU32,
        result: Result<Vec<RawRecord>, CollectorError>,
        delay: Option<Duration>,
    }

    impl FakeCollector {
        fn new(result: Result<Vec<RawRecord>, CollectorError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                result,
                delay: None,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Collector for FakeCollector {
        async fn collect(&self, _source: &Source) -> Result<Vec<RawRecord>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            self.result.clone()
        }
    }

    /// 采集过程中状态被新任务接管
    struct HijackedCollector {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        rows: Vec<RawRecord>,
    }

    #[async_trait::async_trait]
    impl Collector for HijackedCollector {
        async fn collect(&self, source: &Source) -> Result<Vec<RawRecord>, CollectorError> {
            let now = self.clock.now();
            self.store
                .put_status(JobStatus {
                    state: JobState::Running,
                    correlation_id: Some(Uuid::new_v4()),
                    attempt: 1,
                    last_checked_at: Some(now),
                    started_at: Some(now),
                    ..JobStatus::unknown(source.id, now)
                })
                .await;
            Ok(self.rows.clone())
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        ctx: AppContext,
        source: Source,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.executor.retry.jitter = false;
        let ctx = AppContext::with_store(store.clone(), clock.clone(), config);
        let source = ctx
            .sources
            .create(
                &CreateSourceRequest {
                    name: "city-tenders".to_string(),
                    url: "https://example.org/tenders.json".to_string(),
                    collector: None,
                },
                clock.now(),
            )
            .await
            .unwrap();
        Harness {
            clock,
            store,
            ctx,
            source,
        }
    }

    fn executor_with(ctx: &AppContext, collector: Arc<dyn Collector>) -> Executor {
        let mut registry = CollectorRegistry::new();
        registry.register("city-tenders", collector);
        Executor::new(ctx.clone(), Arc::new(registry))
    }

    async fn dispatch(h: &Harness) -> Uuid {
        let correlation_id = Uuid::new_v4();
        let outcome = h
            .ctx
            .statuses
            .try_transition_to_running(h.source.id, correlation_id, h.clock.now(), h.clock.now())
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Acquired(_)));
        h.ctx
            .queue
            .enqueue(&first_ticket(&h.ctx, h.source.id, correlation_id))
            .await
            .unwrap();
        correlation_id
    }

    #[tokio::test]
    async fn test_successful_job_completes_and_marks_collected() {
        let h = harness().await;
        let collector = FakeCollector::new(Ok(vec![
            json!({ "external_id": "1", "title": "Foo" }).as_object().unwrap().clone(),
        ]));
        let executor = executor_with(&h.ctx, collector.clone());
        let correlation_id = dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Completed(stats) if stats.new == 1));

        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.correlation_id, Some(correlation_id));

        let source = SourceStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(source.last_collected_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_exactly_max_retries_plus_one() {
        let h = harness().await;
        let collector = FakeCollector::new(Err(CollectorError::Network("connection reset".into())));
        let executor = executor_with(&h.ctx, collector.clone());
        dispatch(&h).await;

        let mut retries = 0;
        loop {
            match executor.run_next().await.unwrap() {
                Some(AttemptOutcome::Retrying { delay, .. }) => {
                    retries += 1;
                    // 退避期间队列中没有可领取的任务
                    assert_eq!(executor.run_next().await.unwrap(), None);
                    h.clock.advance(chrono::Duration::from_std(delay).unwrap());
                }
                Some(AttemptOutcome::Failed(message)) => {
                    assert!(message.contains("connection reset"));
                    break;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        let max_retries = h.ctx.config.executor.retry.max_retries;
        assert_eq!(retries, max_retries);
        assert_eq!(collector.calls(), max_retries + 1);

        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.attempt, (max_retries + 1) as i32);
        let source = SourceStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert!(source.last_collected_at.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_error_fails_fast() {
        let h = harness().await;
        let collector = FakeCollector::new(Err(CollectorError::Unexpected("bug".into())));
        let executor = executor_with(&h.ctx, collector.clone());
        dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed(_)));
        assert_eq!(collector.calls(), 1);
        assert_eq!(h.ctx.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_domain_failure_uses_fixed_backoff() {
        let h = harness().await;
        let collector = FakeCollector::new(Err(CollectorError::Structure("table missing".into())));
        let executor = executor_with(&h.ctx, collector);
        dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        let fixed = Duration::from_secs(h.ctx.config.executor.retry.fixed_backoff_secs);
        assert_eq!(
            outcome,
            AttemptOutcome::Retrying {
                next_attempt: 2,
                delay: fixed
            }
        );
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_terminal_timeout() {
        let h = harness().await;
        let collector = Arc::new(FakeCollector {
            calls: AtomicU32::new(0),
            result: Ok(vec![]),
            delay: Some(Duration::from_secs(5)),
        });
        let executor = executor_with(&h.ctx, collector);

        let correlation_id = Uuid::new_v4();
        h.ctx
            .statuses
            .try_transition_to_running(h.source.id, correlation_id, h.clock.now(), h.clock.now())
            .await
            .unwrap();
        let now = h.clock.now();
        let ticket = JobTicket::first(
            h.source.id,
            correlation_id,
            now,
            now + chrono::Duration::milliseconds(50),
        );

        let outcome = executor.execute_attempt(ticket).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed(ref m) if m.contains("超时")));
        assert_eq!(h.ctx.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ticket_without_ownership_is_dropped() {
        let h = harness().await;
        let collector = FakeCollector::new(Ok(vec![]));
        let executor = executor_with(&h.ctx, collector.clone());
        dispatch(&h).await;

        let stray = first_ticket(&h.ctx, h.source.id, Uuid::new_v4());
        let outcome = executor.execute_attempt(stray).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Dropped);
        assert_eq!(collector.calls(), 0);
    }

    #[tokio::test]
    async fn test_late_completion_does_not_mark_collected() {
        let h = harness().await;
        let collector = Arc::new(HijackedCollector {
            store: h.store.clone(),
            clock: h.clock.clone(),
            rows: vec![],
        });
        let executor = executor_with(&h.ctx, collector);
        let correlation_id = dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Dropped);

        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_ne!(status.correlation_id, Some(correlation_id));
        let source = SourceStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert!(source.last_collected_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_collector_is_unexpected() {
        let h = harness().await;
        let executor = Executor::new(h.ctx.clone(), Arc::new(CollectorRegistry::new()));
        dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed(ref m) if m.contains("未注册")));
    }

    fn tender_rows(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                json!({ "external_id": i.to_string(), "title": format!("Tender {i}") })
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect()
    }

    fn with_config(h: &Harness, edit: impl FnOnce(&mut Config)) -> AppContext {
        let mut config = (*h.ctx.config).clone();
        edit(&mut config);
        let mut ctx = h.ctx.clone();
        ctx.config = Arc::new(config);
        ctx
    }

    /// 每次查询 latest 都让时钟前进 100 秒，并尝试再次触发同一数据源
    struct SlowRecords {
        inner: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        scheduler: OnceLock<Scheduler>,
        triggers: Mutex<Vec<ScheduleOutcome>>,
    }

    #[async_trait::async_trait]
    impl RecordStore for SlowRecords {
        async fn find_latest(
            &self,
            source_id: Uuid,
            keys: &[String],
        ) -> AppResult<HashMap<String, Record>> {
            let found = RecordStore::find_latest(self.inner.as_ref(), source_id, keys).await?;
            self.clock.advance(chrono::Duration::seconds(100));
            if let Some(scheduler) = self.scheduler.get() {
                let outcome = scheduler.trigger(source_id, true).await?;
                self.triggers.lock().unwrap().push(outcome);
            }
            Ok(found)
        }

        async fn apply_changes(&self, changes: &[RecordChange], now: DateTime<Utc>) -> AppResult<()> {
            self.inner.apply_changes(changes, now).await
        }

        async fn list_latest(&self, source_id: Uuid) -> AppResult<Vec<Record>> {
            self.inner.list_latest(source_id).await
        }

        async fn history(&self, source_id: Uuid, natural_key: &str) -> AppResult<Vec<RecordHistory>> {
            self.inner.history(source_id, natural_key).await
        }
    }

    /// 前若干次心跳返回连接池超时
    struct FlakyStatuses {
        inner: Arc<MemoryStore>,
        failing_heartbeats: AtomicU32,
    }

    #[async_trait::async_trait]
    impl StatusStore for FlakyStatuses {
        async fn get(&self, source_id: Uuid) -> AppResult<Option<JobStatus>> {
            StatusStore::get(self.inner.as_ref(), source_id).await
        }

        async fn list(&self) -> AppResult<Vec<JobStatus>> {
            StatusStore::list(self.inner.as_ref()).await
        }

        async fn try_transition_to_running(
            &self,
            source_id: Uuid,
            correlation_id: Uuid,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> AppResult<TransitionOutcome> {
            self.inner
                .try_transition_to_running(source_id, correlation_id, now, stale_before)
                .await
        }

        async fn heartbeat(
            &self,
            source_id: Uuid,
            correlation_id: Uuid,
            attempt: i32,
            now: DateTime<Utc>,
        ) -> AppResult<bool> {
            let remaining = self.failing_heartbeats.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_heartbeats.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.heartbeat(source_id, correlation_id, attempt, now).await
        }

        async fn complete(
            &self,
            source_id: Uuid,
            correlation_id: Uuid,
            response_time_ms: i64,
            now: DateTime<Utc>,
        ) -> AppResult<bool> {
            self.inner
                .complete(source_id, correlation_id, response_time_ms, now)
                .await
        }

        async fn fail(
            &self,
            source_id: Uuid,
            correlation_id: Uuid,
            message: &str,
            now: DateTime<Utc>,
        ) -> AppResult<bool> {
            self.inner.fail(source_id, correlation_id, message, now).await
        }

        async fn sweep_stale(
            &self,
            stale_before: DateTime<Utc>,
            message: &str,
            now: DateTime<Utc>,
        ) -> AppResult<Vec<JobStatus>> {
            self.inner.sweep_stale(stale_before, message, now).await
        }

        async fn record_health(&self, health: &SourceHealth) -> AppResult<()> {
            self.inner.record_health(health).await
        }

        async fn get_health(&self, source_id: Uuid) -> AppResult<Option<SourceHealth>> {
            self.inner.get_health(source_id).await
        }

        async fn list_health(&self) -> AppResult<Vec<SourceHealth>> {
            self.inner.list_health().await
        }

        async fn append_check(&self, check: &NewStatusCheck) -> AppResult<()> {
            self.inner.append_check(check).await
        }

        async fn recent_checks(&self, source_id: Uuid, limit: i64) -> AppResult<Vec<StatusCheck>> {
            self.inner.recent_checks(source_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_long_reconcile_keeps_source_exclusive() {
        let h = harness().await;
        let mut ctx = with_config(&h, |c| c.reconcile.batch_size = 1);
        let records = Arc::new(SlowRecords {
            inner: h.store.clone(),
            clock: h.clock.clone(),
            scheduler: OnceLock::new(),
            triggers: Mutex::new(Vec::new()),
        });
        ctx.records = records.clone();
        let _ = records.scheduler.set(Scheduler::new(ctx.clone()));

        let executor = executor_with(&ctx, FakeCollector::new(Ok(tender_rows(3))));
        let correlation_id = dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Completed(stats) if stats.new == 3));

        // 合并总耗时 300 秒，超过僵死阈值，但每个批次前都刷新了心跳
        let triggers = records.triggers.lock().unwrap().clone();
        assert_eq!(triggers.len(), 3);
        for outcome in triggers {
            assert!(matches!(
                outcome,
                ScheduleOutcome::Skipped { reason: SkipReason::AlreadyRunning, correlation_id: Some(c), .. }
                    if c == correlation_id
            ));
        }

        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.correlation_id, Some(correlation_id));
        let source = SourceStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(source.last_collected_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_reconcile_stops_when_source_is_taken_over() {
        let h = harness().await;
        let ctx = with_config(&h, |c| c.reconcile.batch_size = 1);

        // 采集期间状态被新任务接管，之后的批次一条都不写
        let collector = Arc::new(HijackedCollector {
            store: h.store.clone(),
            clock: h.clock.clone(),
            rows: tender_rows(3),
        });
        let executor = executor_with(&ctx, collector);
        dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        assert_eq!(outcome, AttemptOutcome::Dropped);
        assert!(h.store.list_latest(h.source.id).await.unwrap().is_empty());
        assert_eq!(h.ctx.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_store_error_is_retried() {
        let h = harness().await;
        let mut ctx = h.ctx.clone();
        ctx.statuses = Arc::new(FlakyStatuses {
            inner: h.store.clone(),
            failing_heartbeats: AtomicU32::new(1),
        });
        let collector = FakeCollector::new(Ok(tender_rows(1)));
        let executor = executor_with(&ctx, collector.clone());
        let correlation_id = dispatch(&h).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        let delay = match outcome {
            AttemptOutcome::Retrying { next_attempt: 2, delay } => delay,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(collector.calls(), 0);
        assert_eq!(h.ctx.queue.len().await.unwrap(), 1);
        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.attempt, 2);

        h.clock.advance(chrono::Duration::from_std(delay).unwrap());
        let outcome = executor.run_next().await.unwrap().unwrap();
        assert!(matches!(outcome, AttemptOutcome::Completed(stats) if stats.new == 1));
        let status = StatusStore::get(h.store.as_ref(), h.source.id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn test_batch_commit_failure_retries_and_dedups_committed_rows() {
        let h = harness().await;
        let ctx = with_config(&h, |c| c.reconcile.batch_size = 2);
        let collector = FakeCollector::new(Ok(tender_rows(5)));
        let executor = executor_with(&ctx, collector.clone());
        dispatch(&h).await;
        h.store.fail_batches_after(1).await;

        let outcome = executor.run_next().await.unwrap().unwrap();
        let delay = match outcome {
            AttemptOutcome::Retrying { next_attempt: 2, delay } => delay,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(h.store.list_latest(h.source.id).await.unwrap().len(), 2);

        h.store.fail_batches_after(usize::MAX).await;
        h.clock.advance(chrono::Duration::from_std(delay).unwrap());
        let outcome = executor.run_next().await.unwrap().unwrap();
        match outcome {
            AttemptOutcome::Completed(stats) => {
                assert_eq!((stats.new, stats.duplicate, stats.updated), (3, 2, 0));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(collector.calls(), 2);
        assert_eq!(h.store.list_latest(h.source.id).await.unwrap().len(), 5);
    }
}
