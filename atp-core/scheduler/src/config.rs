//! 调度器配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 失败任务的最大重试次数
    #[serde(default)]
    pub retry_count: u32,

    /// 运行定义未声明超时时使用的运行超时（毫秒）
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_count: 0,
            run_timeout_ms: default_run_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

fn default_run_timeout_ms() -> u64 {
    600_000
}
