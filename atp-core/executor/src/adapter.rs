//! 叶子步骤适配器接口
//!
//! 每种协议（HTTP、数据库、消息总线……）实现 [`StepAdapter`]，
//! 并通过 [`AdapterBuilder`] 注册到 [`crate::AdapterRegistry`]。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::context::{ExtraConfig, RunContext};
use crate::definition::StepDefinition;
use crate::error::StepError;
use crate::variables::VariableScope;

/// 适配器错误
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// 请求已完成但响应表示失败（例如 HTTP 5xx）
    #[error("{message}")]
    Response { message: String, body: Value },

    /// 执行失败
    #[error("{0}")]
    Failed(String),

    /// 已分类的步骤错误，原样透传
    #[error(transparent)]
    Step(#[from] StepError),
}

/// 执行阶段可见的步骤上下文
pub struct StepContext<'a> {
    /// 运行上下文
    pub run: &'a RunContext,

    /// 步骤位置
    pub extra: &'a ExtraConfig,

    /// 步骤定义
    pub definition: &'a StepDefinition,

    /// 步骤变量作用域
    pub scope: &'a mut VariableScope,

    /// 全局步骤序号
    pub step_index: usize,
}

impl StepContext<'_> {
    /// 变量替换后的步骤配置
    pub fn resolved_config(&self) -> Value {
        self.scope.resolve_value(&self.definition.config)
    }
}

/// 叶子步骤适配器
#[async_trait]
pub trait StepAdapter: Send {
    /// 执行前准备（失败归类为系统错误）
    async fn before_execute(&mut self, _ctx: &mut StepContext<'_>) -> Result<(), AdapterError> {
        Ok(())
    }

    /// 可被前置脚本修改的请求
    fn request_mut(&mut self) -> Option<&mut Value> {
        None
    }

    /// 执行步骤，返回响应
    async fn execute(&mut self, ctx: &mut StepContext<'_>) -> Result<Value, AdapterError>;

    /// 执行后清理（无论成功与否都会调用）
    async fn after_execute(&mut self, _ctx: &mut StepContext<'_>) {}

    /// 写入结果节点的附加信息
    fn extra_result(&self) -> Option<Value> {
        None
    }

    /// 写入详情块的数据
    fn detail_result(&self) -> Option<Value> {
        None
    }
}

/// 适配器构建器
#[async_trait]
pub trait AdapterBuilder: Send + Sync {
    /// 为一个步骤构建适配器实例
    fn build(&self, definition: &StepDefinition) -> Box<dyn StepAdapter>;

    /// 预置结果节点的初始附加信息
    fn create_init_result(&self, _definition: &StepDefinition) -> Option<Value> {
        None
    }

    /// 运行开始前的准备
    async fn prepare(
        &self,
        _definition: &StepDefinition,
        _ctx: &RunContext,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}
