use crate::{
    context::AppContext,
    error::{AppError, AppResult},
    models::{HealthState, Source, SourceHealth},
    services::status_tracker::StatusTracker,
};
use reqwest::Client;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单次探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: HealthState,
    pub response_time_ms: i64,
    pub error: Option<String>,
}

/// 连通性探测接口
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, source: &Source) -> ProbeResult;
}

/// HTTP 探测：GET 数据源地址，状态码小于 400 视为可用
#[derive(Debug, Clone)]
pub struct HttpProber {
    http: Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::config(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn probe(&self, source: &Source) -> ProbeResult {
        let started = std::time::Instant::now();
        let result = self.http.get(&source.url).send().await;
        let response_time_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(resp) if resp.status().as_u16() < 400 => ProbeResult {
                status: HealthState::Working,
                response_time_ms,
                error: None,
            },
            Ok(resp) => ProbeResult {
                status: HealthState::NotWorking,
                response_time_ms,
                error: Some(format!("HTTP {}", resp.status())),
            },
            Err(e) => ProbeResult {
                status: HealthState::NotWorking,
                response_time_ms,
                error: Some(if e.is_timeout() {
                    "连接超时".to_string()
                } else {
                    e.to_string()
                }),
            },
        }
    }
}

/// 健康监测服务
///
/// 按自己的节奏探测数据源连通性，只写健康状态与检查日志，不触碰任务状态。
#[derive(Clone)]
pub struct HealthMonitor {
    ctx: AppContext,
    tracker: StatusTracker,
    prober: Arc<dyn Prober>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(ctx: AppContext, prober: Arc<dyn Prober>) -> Self {
        Self {
            tracker: StatusTracker::new(ctx.clone()),
            ctx,
            prober,
        }
    }

    /// 探测单个数据源并记录结果
    pub async fn probe_source(&self, source_id: Uuid) -> AppResult<SourceHealth> {
        let source = self
            .ctx
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("数据源 {}", source_id)))?;
        self.probe_and_record(&source).await
    }

    async fn probe_and_record(&self, source: &Source) -> AppResult<SourceHealth> {
        let result = self.prober.probe(source).await;
        let health = SourceHealth {
            source_id: source.id,
            status: result.status,
            response_time_ms: result.response_time_ms,
            error_message: result.error,
            checked_at: self.ctx.now(),
        };
        self.tracker.record_health(&health).await?;

        debug!(
            source = %source.name,
            status = %health.status,
            response_time_ms = health.response_time_ms,
            "健康探测完成"
        );
        Ok(health)
    }

    /// 并发探测所有活跃数据源，返回 (可用, 不可用) 数量
    pub async fn run_round(&self) -> AppResult<(usize, usize)> {
        let sources = self.ctx.sources.list(true).await?;
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.health.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for source in sources {
            let monitor = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match monitor.probe_and_record(&source).await {
                    Ok(health) => Some(health.status),
                    Err(e) => {
                        warn!(source = %source.name, error = %e, "记录健康探测结果失败");
                        None
                    }
                }
            });
        }

        let (mut working, mut not_working) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(HealthState::Working)) => working += 1,
                Ok(Some(HealthState::NotWorking)) => not_working += 1,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "健康探测任务异常退出"),
            }
        }

        info!("健康探测完成: 可用 {}，不可用 {}", working, not_working);
        Ok((working, not_working))
    }

    /// 周期探测循环
    pub async fn start(self) {
        let period = std::time::Duration::from_secs(self.ctx.config.health.interval_secs);
        info!("健康监测已启动，间隔 {:?}", period);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_round().await {
                warn!(error = %e, "健康探测轮次失败");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        config::Config,
        models::{CreateSourceRequest, JobState},
        repositories::MemoryStore,
    };

    /// 名称以 down 开头的数据源探测失败
    struct FakeProber;

    #[async_trait::async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, source: &Source) -> ProbeResult {
            if source.name.starts_with("down") {
                ProbeResult {
                    status: HealthState::NotWorking,
                    response_time_ms: 15_000,
                    error: Some("连接超时".to_string()),
                }
            } else {
                ProbeResult {
                    status: HealthState::Working,
                    response_time_ms: 120,
                    error: None,
                }
            }
        }
    }

    async fn setup(names: &[&str]) -> (AppContext, HealthMonitor, Vec<Source>) {
        let ctx = AppContext::with_store(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            Config::default(),
        );
        let mut sources = Vec::new();
        for name in names {
            let source = ctx
                .sources
                .create(
                    &CreateSourceRequest {
                        name: name.to_string(),
                        url: format!("https://{name}.example.org"),
                        collector: None,
                    },
                    ctx.now(),
                )
                .await
                .unwrap();
            sources.push(source);
        }
        let monitor = HealthMonitor::new(ctx.clone(), Arc::new(FakeProber));
        (ctx, monitor, sources)
    }

    #[tokio::test]
    async fn test_round_probes_all_active_sources() {
        let (_, monitor, _) = setup(&["alpha", "beta", "down-gamma"]).await;
        assert_eq!(monitor.run_round().await.unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn test_probe_never_touches_job_status() {
        let (ctx, monitor, sources) = setup(&["down-alpha"]).await;
        let source_id = sources[0].id;
        let tracker = StatusTracker::new(ctx.clone());
        let correlation_id = Uuid::new_v4();
        tracker
            .try_transition_to_running(source_id, correlation_id)
            .await
            .unwrap();

        let health = monitor.probe_source(source_id).await.unwrap();
        assert_eq!(health.status, HealthState::NotWorking);
        assert_eq!(health.error_message.as_deref(), Some("连接超时"));

        let view = tracker.get(source_id).await.unwrap();
        assert_eq!(view.state, JobState::Running);
        assert_eq!(view.correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn test_probe_unknown_source() {
        let (_, monitor, _) = setup(&[]).await;
        let err = monitor.probe_source(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }
}
