//! 适配器注册表

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::adapter::AdapterBuilder;
use crate::builtins::{EchoBuilder, ScriptBuilder, WaitBuilder};
use crate::{ExecutorError, Result};

/// 适配器注册表
///
/// 步骤类型标签 → 构建器。组合类型不经过注册表。
pub struct AdapterRegistry {
    builders: Arc<RwLock<HashMap<String, Arc<dyn AdapterBuilder>>>>,
}

impl AdapterRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            builders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 创建包含内置适配器（wait / echo / script）的注册表
    pub fn with_builtins() -> Self {
        let mut builders: HashMap<String, Arc<dyn AdapterBuilder>> = HashMap::new();
        builders.insert("wait".to_string(), Arc::new(WaitBuilder));
        builders.insert("echo".to_string(), Arc::new(EchoBuilder));
        builders.insert("script".to_string(), Arc::new(ScriptBuilder));
        Self {
            builders: Arc::new(RwLock::new(builders)),
        }
    }

    /// 注册适配器
    pub async fn register(&self, name: &str, builder: Arc<dyn AdapterBuilder>) -> Result<()> {
        info!("注册适配器: {}", name);

        let mut builders = self.builders.write().await;

        if builders.contains_key(name) {
            return Err(ExecutorError::AdapterAlreadyRegistered(name.to_string()));
        }

        builders.insert(name.to_string(), builder);

        Ok(())
    }

    /// 注销适配器
    pub async fn unregister(&self, name: &str) -> Result<()> {
        info!("注销适配器: {}", name);

        let mut builders = self.builders.write().await;

        builders
            .remove(name)
            .ok_or_else(|| ExecutorError::AdapterNotFound(name.to_string()))?;

        Ok(())
    }

    /// 获取构建器
    pub async fn get(&self, name: &str) -> Result<Arc<dyn AdapterBuilder>> {
        debug!("获取适配器: {}", name);

        let builders = self.builders.read().await;

        builders
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::AdapterNotFound(name.to_string()))
    }

    /// 列出所有已注册的适配器
    pub async fn list(&self) -> Vec<String> {
        let builders = self.builders.read().await;
        let mut names: Vec<String> = builders.keys().cloned().collect();
        names.sort();
        names
    }

    /// 检查适配器是否已注册
    pub async fn is_registered(&self, name: &str) -> bool {
        let builders = self.builders.read().await;
        builders.contains_key(name)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
