// 服务层模块
pub mod collector;
pub mod executor;
pub mod health_monitor;
pub mod json_feed;
pub mod normalize;
pub mod reconciler;
pub mod scheduler;
pub mod status_tracker;

pub use collector::{Collector, CollectorRegistry};
pub use executor::{AttemptOutcome, Executor};
pub use health_monitor::{HealthMonitor, HttpProber, ProbeResult, Prober};
pub use json_feed::JsonFeedCollector;
pub use normalize::{NormalizedRecord, Normalizer, RowError};
pub use reconciler::Reconciler;
pub use scheduler::{ScheduleOutcome, Scheduler, SkipReason};
pub use status_tracker::StatusTracker;
