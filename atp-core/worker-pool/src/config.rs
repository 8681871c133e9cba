//! 工作池配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 工作池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 最大工作者数量
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// 空闲回收时间（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// 运行超时后强制终止前的宽限时间（秒）
    #[serde(default = "default_force_kill_grace_secs")]
    pub force_kill_grace_secs: u64,

    /// 心跳丢失多久视为无响应（秒）
    #[serde(default = "default_unresponsive_secs")]
    pub unresponsive_secs: u64,

    /// 心跳间隔（毫秒）
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// 巡检间隔（毫秒）
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            idle_timeout_secs: default_idle_timeout_secs(),
            force_kill_grace_secs: default_force_kill_grace_secs(),
            unresponsive_secs: default_unresponsive_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn force_kill_grace(&self) -> Duration {
        Duration::from_secs(self.force_kill_grace_secs)
    }

    pub fn unresponsive(&self) -> Duration {
        Duration::from_secs(self.unresponsive_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

// 默认值函数
fn default_max_workers() -> usize {
    4
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_force_kill_grace_secs() -> u64 {
    30
}

fn default_unresponsive_secs() -> u64 {
    60
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_workers": 2}"#).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }
}
