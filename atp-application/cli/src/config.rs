//! 引擎配置
//!
//! 查找顺序: `--config` → `ATP_ENGINE_CONFIG` → `./atp-engine.toml` →
//! `~/.config/atp/engine.toml` → 默认值

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use atp_executor::{RunOptions, ThrottlePolicy};
use atp_scheduler::SchedulerConfig;
use atp_worker_pool::PoolConfig;

/// 指定配置文件的环境变量
pub const CONFIG_ENV: &str = "ATP_ENGINE_CONFIG";

const LOCAL_CONFIG: &str = "atp-engine.toml";

/// 引擎配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 工作池
    #[serde(default)]
    pub pool: PoolConfig,

    /// 调度器
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// 运行默认选项
    #[serde(default)]
    pub run: RunOptions,

    /// 进度通知节流
    #[serde(default)]
    pub throttle: ThrottlePolicy,

    /// 文件缓存目录（支持 `~`），不设置时不启用文件缓存
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
}

impl EngineConfig {
    /// 用户级配置文件路径
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("atp").join("engine.toml"))
    }

    /// 按查找顺序定位配置文件
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(shellexpand::tilde(&path).into_owned()));
            }
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Some(local);
        }
        Self::user_config_path().filter(|path| path.exists())
    }

    /// 加载配置，同时返回实际使用的文件
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match Self::locate(explicit) {
            Some(path) => Ok((Self::from_file(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 展开后的缓存目录
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
cache_dir = "/tmp/atp-cache"

[pool]
max_workers = 8

[scheduler]
retry_count = 2

[run]
ignore_errors = true

[throttle]
tiers = [{ min_steps = 0, interval_ms = 50 }]
"#,
        )
        .unwrap();

        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.scheduler.retry_count, 2);
        assert!(config.run.ignore_errors);
        assert_eq!(config.run.timeout_ms, RunOptions::default().timeout_ms);
        assert_eq!(config.throttle.tiers.len(), 1);
        assert_eq!(config.cache_dir(), Some(PathBuf::from("/tmp/atp-cache")));
    }

    #[test]
    fn test_explicit_path_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmax_workers = 1").unwrap();

        let (config, used) = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(used.as_deref(), Some(file.path()));
        assert_eq!(config.pool.max_workers, 1);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(EngineConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_tilde_expanded_in_cache_dir() {
        let config = EngineConfig {
            cache_dir: Some("~/atp-cache".to_string()),
            ..Default::default()
        };
        let dir = config.cache_dir().unwrap();
        assert!(!dir.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
    }
}
