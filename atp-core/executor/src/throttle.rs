//! 进度通知节流

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// 节流档位：节点数达到 `min_steps` 后使用 `interval_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleTier {
    pub min_steps: usize,
    pub interval_ms: u64,
}

/// 节流策略（按 `min_steps` 升序的档位表）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlePolicy {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<ThrottleTier>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

impl ThrottlePolicy {
    pub fn new(mut tiers: Vec<ThrottleTier>) -> Self {
        tiers.sort_by_key(|t| t.min_steps);
        Self { tiers }
    }

    /// 不节流
    pub fn unthrottled() -> Self {
        Self { tiers: Vec::new() }
    }

    /// 给定节点数对应的最小通知间隔
    pub fn interval_for(&self, steps: usize) -> Duration {
        self.tiers
            .iter()
            .filter(|t| t.min_steps <= steps)
            .max_by_key(|t| t.min_steps)
            .map(|t| Duration::from_millis(t.interval_ms))
            .unwrap_or(Duration::ZERO)
    }
}

fn default_tiers() -> Vec<ThrottleTier> {
    vec![
        ThrottleTier { min_steps: 0, interval_ms: 100 },
        ThrottleTier { min_steps: 100, interval_ms: 250 },
        ThrottleTier { min_steps: 1_000, interval_ms: 500 },
        ThrottleTier { min_steps: 10_000, interval_ms: 1_000 },
    ]
}

/// 节流器状态
#[derive(Debug, Clone)]
pub struct Throttle {
    policy: ThrottlePolicy,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self { policy, last: None }
    }

    /// 是否允许本次通知；首次通知总是放行
    pub fn should_emit(&mut self, steps: usize) -> bool {
        let now = Instant::now();
        let allowed = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.policy.interval_for(steps),
        };
        if allowed {
            self.last = Some(now);
        }
        allowed
    }

    /// 强制通知（运行结束时）
    pub fn force(&mut self) {
        self.last = Some(Instant::now());
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }
}
