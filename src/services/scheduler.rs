use crate::{
    context::AppContext,
    error::{AppError, AppResult},
    models::{JobState, TransitionOutcome},
    services::{executor::first_ticket, status_tracker::StatusTracker},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// 跳过派发的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    Cooldown,
    Inactive,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyRunning => write!(f, "already_running"),
            SkipReason::Cooldown => write!(f, "cooldown"),
            SkipReason::Inactive => write!(f, "inactive"),
        }
    }
}

/// 调度结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// 已派发，返回新任务的关联ID
    Dispatched { correlation_id: Uuid },
    /// 未派发
    Skipped {
        reason: SkipReason,
        /// 正在运行的任务的关联ID（already_running 时）
        correlation_id: Option<Uuid>,
        /// 最早可再次派发的时间（cooldown 时）
        next_eligible_at: Option<DateTime<Utc>>,
    },
}

impl ScheduleOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self::Skipped {
            reason,
            correlation_id: None,
            next_eligible_at: None,
        }
    }
}

/// 任务调度器
///
/// 决定何时派发采集任务。互斥判定最终落在状态存储的原子切换上，
/// 并发调用同一数据源时只有一个成功。
#[derive(Debug, Clone)]
pub struct Scheduler {
    ctx: AppContext,
    tracker: StatusTracker,
}

impl Scheduler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            tracker: StatusTracker::new(ctx.clone()),
            ctx,
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.ctx.config.scheduler.cooldown_secs as i64)
    }

    fn interval(&self) -> Duration {
        Duration::seconds(self.ctx.config.scheduler.interval_secs as i64)
    }

    /// 按需触发
    pub async fn trigger(&self, source_id: Uuid, force: bool) -> AppResult<ScheduleOutcome> {
        info!(source_id = %source_id, force, "收到手动触发请求");
        self.schedule(source_id, force).await
    }

    /// 尝试派发一次采集任务
    ///
    /// `force` 只跳过冷却期；已有任务在运行时始终拒绝。
    pub async fn schedule(&self, source_id: Uuid, force: bool) -> AppResult<ScheduleOutcome> {
        let source = self
            .ctx
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("数据源 {}", source_id)))?;

        if !source.is_active {
            return Ok(ScheduleOutcome::skipped(SkipReason::Inactive));
        }

        let current = self.tracker.get(source_id).await?;
        if current.state == JobState::Running {
            return Ok(ScheduleOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
                correlation_id: current.correlation_id,
                next_eligible_at: None,
            });
        }

        let now = self.ctx.now();
        if !force {
            if let Some(until) = source.cooldown_until(self.cooldown()) {
                if now < until {
                    debug!(source_id = %source_id, "处于冷却期，跳过");
                    return Ok(ScheduleOutcome::Skipped {
                        reason: SkipReason::Cooldown,
                        correlation_id: None,
                        next_eligible_at: Some(until),
                    });
                }
            }
        }

        let correlation_id = Uuid::new_v4();
        match self
            .tracker
            .try_transition_to_running(source_id, correlation_id)
            .await?
        {
            TransitionOutcome::AlreadyRunning(running) => Ok(ScheduleOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
                correlation_id: running.correlation_id,
                next_eligible_at: None,
            }),
            TransitionOutcome::Acquired(_) => {
                let ticket = first_ticket(&self.ctx, source_id, correlation_id);
                if let Err(e) = self.ctx.queue.enqueue(&ticket).await {
                    // 入队失败不能让数据源卡在 running
                    let message = format!("任务入队失败: {}", e);
                    self.tracker.fail(source_id, correlation_id, &message).await?;
                    return Err(e);
                }
                info!(
                    source_id = %source_id,
                    correlation_id = %correlation_id,
                    source = %source.name,
                    "任务已派发"
                );
                Ok(ScheduleOutcome::Dispatched { correlation_id })
            }
        }
    }

    /// 检查所有活跃数据源，派发到期的任务
    pub async fn tick(&self) -> AppResult<Vec<(Uuid, ScheduleOutcome)>> {
        let now = self.ctx.now();
        let interval = self.interval();
        let mut results = Vec::new();

        for source in self.ctx.sources.list(true).await? {
            if !source.is_due(now, interval) {
                continue;
            }
            match self.schedule(source.id, false).await {
                Ok(outcome) => results.push((source.id, outcome)),
                Err(e) => warn!(source_id = %source.id, error = %e, "周期派发失败"),
            }
        }

        let dispatched = results
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ScheduleOutcome::Dispatched { .. }))
            .count();
        if dispatched > 0 {
            info!("周期调度派发 {} 个任务", dispatched);
        }
        Ok(results)
    }

    /// 周期调度循环
    pub async fn start(self) {
        let period = std::time::Duration::from_secs(self.ctx.config.scheduler.tick_secs);
        info!("调度器已启动，检查间隔 {:?}，采集周期 {} 秒", period, self.ctx.config.scheduler.interval_secs);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "调度器执行失败");
            }
        }
    }
}
