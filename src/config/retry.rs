use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::FailureKind;

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大重试次数（首次执行不计入）
    pub max_retries: u32,
    /// 初始退避时间（秒）
    pub initial_backoff_secs: u64,
    /// 最大退避时间（秒）
    pub max_backoff_secs: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
    /// 采集层失败（站点结构变化等）的固定退避时间（秒）
    pub fixed_backoff_secs: u64,
    /// 添加随机抖动以避免惊群效应
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 120,
            backoff_multiplier: 2.0,
            fixed_backoff_secs: 30,
            jitter: true,
        }
    }
}

/// 一次失败后的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 延迟后重新入队
    RetryAfter(Duration),
    /// 放弃，写入 error 状态
    GiveUp(String),
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff_secs == 0 {
            return Err("初始退避时间必须大于0".into());
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            return Err("最大退避时间不能小于初始退避时间".into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("退避倍率不能小于1".into());
        }
        if self.fixed_backoff_secs == 0 || self.fixed_backoff_secs > self.max_backoff_secs {
            return Err("固定退避时间应在1到最大退避时间之间".into());
        }
        Ok(())
    }

    /// 根据失败分类和已完成的尝试次数给出重试决定
    ///
    /// `attempt` 从 1 开始计数，最多执行 `max_retries + 1` 次。
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::GiveUp(format!("{} 类错误不重试", kind));
        }
        if attempt > self.max_retries {
            return RetryDecision::GiveUp(format!(
                "已达到最大重试次数 {}（共尝试 {} 次）",
                self.max_retries, attempt
            ));
        }

        let base_secs = match kind {
            FailureKind::DomainCollection => self.fixed_backoff_secs,
            _ => self.exponential_backoff_secs(attempt),
        };
        let delay_secs = if self.jitter {
            self.add_jitter(base_secs)
        } else {
            base_secs
        };
        RetryDecision::RetryAfter(Duration::from_secs(delay_secs))
    }

    fn exponential_backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        (secs as u64).min(self.max_backoff_secs)
    }

    fn add_jitter(&self, base_secs: u64) -> u64 {
        let jitter_range = (base_secs as f64 * 0.1) as u64; // 10% 抖动
        let jitter = rand::random::<f64>() * jitter_range.max(1) as f64;
        (base_secs + jitter as u64).min(self.max_backoff_secs)
    }
}
