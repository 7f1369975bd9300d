use crate::{
    context::AppContext,
    error::AppResult,
    models::{
        CheckKind, JobStatus, JobStatusView, NewStatusCheck, SourceHealth, StatusCheck,
        TransitionOutcome, stale_message,
    },
};
use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 状态跟踪服务
///
/// 每个数据源一行权威状态。终态写入必须携带当前的关联ID且状态仍为 running，
/// 否则被静默丢弃，旧任务的迟到结果不会覆盖新任务。
#[derive(Debug, Clone)]
pub struct StatusTracker {
    ctx: AppContext,
}

impl StatusTracker {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.ctx.stale_threshold()
    }

    /// 查询派生状态，僵死的 running 报告为 error
    pub async fn get(&self, source_id: Uuid) -> AppResult<JobStatusView> {
        let now = self.ctx.now();
        let status = self
            .ctx
            .statuses
            .get(source_id)
            .await?
            .unwrap_or_else(|| JobStatus::unknown(source_id, now));
        Ok(status.view(now, self.ctx.stale_threshold()))
    }

    pub async fn list(&self) -> AppResult<Vec<JobStatusView>> {
        let now = self.ctx.now();
        let threshold = self.ctx.stale_threshold();
        Ok(self
            .ctx
            .statuses
            .list()
            .await?
            .iter()
            .map(|status| status.view(now, threshold))
            .collect())
    }

    /// 原子地切换到 running
    pub async fn try_transition_to_running(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
    ) -> AppResult<TransitionOutcome> {
        let now = self.ctx.now();
        let outcome = self
            .ctx
            .statuses
            .try_transition_to_running(source_id, correlation_id, now, self.stale_before(now))
            .await?;

        match &outcome {
            TransitionOutcome::Acquired(_) => {
                debug!(source_id = %source_id, correlation_id = %correlation_id, "状态切换为 running");
            }
            TransitionOutcome::AlreadyRunning(current) => {
                debug!(
                    source_id = %source_id,
                    running = ?current.correlation_id,
                    "已有任务在运行，拒绝切换"
                );
            }
        }
        Ok(outcome)
    }

    /// 刷新心跳，返回该关联ID是否仍持有状态
    pub async fn heartbeat(&self, source_id: Uuid, correlation_id: Uuid, attempt: i32) -> AppResult<bool> {
        self.ctx
            .statuses
            .heartbeat(source_id, correlation_id, attempt, self.ctx.now())
            .await
    }

    /// running -> completed，返回写入是否被接受
    pub async fn complete(
        &self,
        source_id: Uuid,
        correlation_id: Uuid,
        response_time_ms: i64,
        summary: &str,
    ) -> AppResult<bool> {
        let now = self.ctx.now();
        let accepted = self
            .ctx
            .statuses
            .complete(source_id, correlation_id, response_time_ms, now)
            .await?;

        if accepted {
            self.log_check(NewStatusCheck {
                source_id,
                kind: CheckKind::Job,
                outcome: "completed".to_string(),
                correlation_id: Some(correlation_id),
                response_time_ms: Some(response_time_ms),
                message: Some(summary.to_string()),
                checked_at: now,
            })
            .await;
        } else {
            warn!(
                source_id = %source_id,
                correlation_id = %correlation_id,
                "完成状态被丢弃：关联ID已过期或任务不在运行"
            );
        }
        Ok(accepted)
    }

    /// running -> error，返回写入是否被接受
    pub async fn fail(&self, source_id: Uuid, correlation_id: Uuid, message: &str) -> AppResult<bool> {
        let now = self.ctx.now();
        let accepted = self
            .ctx
            .statuses
            .fail(source_id, correlation_id, message, now)
            .await?;

        if accepted {
            self.log_check(NewStatusCheck {
                source_id,
                kind: CheckKind::Job,
                outcome: "error".to_string(),
                correlation_id: Some(correlation_id),
                response_time_ms: None,
                message: Some(message.to_string()),
                checked_at: now,
            })
            .await;
        } else {
            warn!(
                source_id = %source_id,
                correlation_id = %correlation_id,
                "失败状态被丢弃：关联ID已过期或任务不在运行"
            );
        }
        Ok(accepted)
    }

    /// 将僵死的 running 持久化为 error
    pub async fn sweep(&self) -> AppResult<Vec<JobStatus>> {
        let now = self.ctx.now();
        let message = stale_message(self.ctx.stale_threshold());
        let swept = self
            .ctx
            .statuses
            .sweep_stale(self.stale_before(now), &message, now)
            .await?;

        for status in &swept {
            warn!(
                source_id = %status.source_id,
                correlation_id = ?status.correlation_id,
                "僵死任务已标记为 error"
            );
            self.log_check(NewStatusCheck {
                source_id: status.source_id,
                kind: CheckKind::Job,
                outcome: "error".to_string(),
                correlation_id: status.correlation_id,
                response_time_ms: None,
                message: Some(message.clone()),
                checked_at: now,
            })
            .await;
        }
        Ok(swept)
    }

    /// 周期清扫僵死状态
    pub async fn start_sweeper(self) {
        let period = std::time::Duration::from_secs(self.ctx.config.status.sweep_interval_secs);
        info!("僵死状态清扫器已启动，间隔 {:?}", period);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "僵死状态清扫失败");
            }
        }
    }

    pub async fn record_health(&self, health: &SourceHealth) -> AppResult<()> {
        self.ctx.statuses.record_health(health).await?;
        self.log_check(NewStatusCheck {
            source_id: health.source_id,
            kind: CheckKind::Probe,
            outcome: health.status.to_string(),
            correlation_id: None,
            response_time_ms: Some(health.response_time_ms),
            message: health.error_message.clone(),
            checked_at: health.checked_at,
        })
        .await;
        Ok(())
    }

    pub async fn get_health(&self, source_id: Uuid) -> AppResult<Option<SourceHealth>> {
        self.ctx.statuses.get_health(source_id).await
    }

    pub async fn list_health(&self) -> AppResult<Vec<SourceHealth>> {
        self.ctx.statuses.list_health().await
    }

    pub async fn recent_checks(&self, source_id: Uuid, limit: i64) -> AppResult<Vec<StatusCheck>> {
        self.ctx.statuses.recent_checks(source_id, limit).await
    }

    /// 检查日志写入失败不影响状态本身
    async fn log_check(&self, check: NewStatusCheck) {
        if let Err(e) = self.ctx.statuses.append_check(&check).await {
            warn!(source_id = %check.source_id, error = %e, "写入状态检查日志失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        config::Config,
        models::{HealthState, JobState},
        repositories::{MemoryStore, StatusStore},
    };
    use chrono::Duration;
    use std::sync::Arc;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, StatusTracker) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let ctx = AppContext::with_store(store.clone(), clock.clone(), Config::default());
        (clock, store, StatusTracker::new(ctx))
    }

    #[tokio::test]
    async fn test_unknown_source_reports_unknown() {
        let (_, _, tracker) = setup();
        let view = tracker.get(Uuid::new_v4()).await.unwrap();
        assert_eq!(view.state, JobState::Unknown);
        assert!(view.correlation_id.is_none());
    }

    #[tokio::test]
    async fn test_stale_completion_does_not_overwrite_newer_job() {
        let (clock, _, tracker) = setup();
        let source_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        assert!(matches!(
            tracker.try_transition_to_running(source_id, c1).await.unwrap(),
            TransitionOutcome::Acquired(_)
        ));

        // C1 失联，超过阈值后 C2 接管
        clock.advance(Duration::seconds(181));
        assert!(matches!(
            tracker.try_transition_to_running(source_id, c2).await.unwrap(),
            TransitionOutcome::Acquired(_)
        ));

        assert!(!tracker.complete(source_id, c1, 10, "late").await.unwrap());
        assert!(!tracker.fail(source_id, c1, "late").await.unwrap());

        let view = tracker.get(source_id).await.unwrap();
        assert_eq!(view.state, JobState::Running);
        assert_eq!(view.correlation_id, Some(c2));

        assert!(tracker.complete(source_id, c2, 25, "ok").await.unwrap());
        assert_eq!(tracker.get(source_id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_job_alive() {
        let (clock, _, tracker) = setup();
        let source_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        tracker.try_transition_to_running(source_id, c1).await.unwrap();

        for _ in 0..5 {
            clock.advance(Duration::seconds(100));
            assert!(tracker.heartbeat(source_id, c1, 1).await.unwrap());
        }
        let view = tracker.get(source_id).await.unwrap();
        assert_eq!(view.state, JobState::Running);

        // 心跳不会被其他关联ID刷新
        assert!(!tracker.heartbeat(source_id, Uuid::new_v4(), 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_persists_stale_error() {
        let (clock, store, tracker) = setup();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        tracker.try_transition_to_running(stale, Uuid::new_v4()).await.unwrap();
        clock.advance(Duration::seconds(120));
        tracker.try_transition_to_running(fresh, Uuid::new_v4()).await.unwrap();
        clock.advance(Duration::seconds(90));

        // 读取时已派生为 error
        let view = tracker.get(stale).await.unwrap();
        assert_eq!(view.state, JobState::Error);
        assert_eq!(view.persisted_state, JobState::Running);

        let swept = tracker.sweep().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].source_id, stale);

        let persisted = StatusStore::get(store.as_ref(), stale).await.unwrap().unwrap();
        assert_eq!(persisted.state, JobState::Error);
        assert!(persisted.error_message.unwrap().contains("180"));
        assert_eq!(tracker.get(fresh).await.unwrap().state, JobState::Running);

        let checks = tracker.recent_checks(stale, 10).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].outcome, "error");
    }

    #[tokio::test]
    async fn test_health_is_independent_of_job_status() {
        let (clock, _, tracker) = setup();
        let source_id = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        tracker.try_transition_to_running(source_id, c1).await.unwrap();

        tracker
            .record_health(&SourceHealth {
                source_id,
                status: HealthState::NotWorking,
                response_time_ms: 15_000,
                error_message: Some("timeout".to_string()),
                checked_at: clock.now(),
            })
            .await
            .unwrap();

        let view = tracker.get(source_id).await.unwrap();
        assert_eq!(view.state, JobState::Running);
        assert_eq!(view.correlation_id, Some(c1));

        let health = tracker.get_health(source_id).await.unwrap().unwrap();
        assert_eq!(health.status, HealthState::NotWorking);

        let checks = tracker.recent_checks(source_id, 10).await.unwrap();
        assert_eq!(checks[0].kind, "probe");
    }
}
