pub mod health;
pub mod job;
pub mod source;

pub use health::{get_source_health, health_check, probe_source};
pub use job::{get_source_status, list_source_checks, trigger_source};
pub use source::{create_source, list_sources};

use crate::{
    context::AppContext,
    services::{HealthMonitor, Scheduler, StatusTracker},
};

/// 应用状态
#[derive(Debug, Clone)]
pub struct AppState {
    pub ctx: AppContext,
    pub scheduler: Scheduler,
    pub tracker: StatusTracker,
    pub health: HealthMonitor,
}

impl AppState {
    pub fn new(ctx: AppContext, health: HealthMonitor) -> Self {
        Self {
            scheduler: Scheduler::new(ctx.clone()),
            tracker: StatusTracker::new(ctx.clone()),
            ctx,
            health,
        }
    }
}
