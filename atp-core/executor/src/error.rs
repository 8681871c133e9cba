//! 步骤级错误
//!
//! 步骤错误只记录在结果树中，不会传播到运行之外。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单条断言失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertFailure {
    /// 断言下标
    pub index: usize,
    /// 失败描述
    pub message: String,
}

/// 失败的子步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildFailure {
    /// 分组下标（静态子步骤为 None）
    pub group: Option<usize>,
    /// 组内下标
    pub index: usize,
    /// 子步骤 ID
    pub id: String,
}

/// 步骤错误分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("系统错误: {0}")]
    System(String),

    #[error("前置脚本 #{index} 执行失败: {message}")]
    PreScript { index: usize, message: String },

    #[error("执行失败: {0}")]
    Execute(String),

    #[error("响应错误: {0}")]
    Response(String),

    #[error("后置脚本 #{index} 执行失败: {message}")]
    PostScript { index: usize, message: String },

    #[error("变量赋值 #{index} 失败: {message}")]
    Assignment { index: usize, message: String },

    #[error("断言失败: {}", format_asserts(.failures))]
    Assert { failures: Vec<AssertFailure> },

    #[error("子步骤失败: {}", format_children(.failures))]
    Combination { failures: Vec<ChildFailure> },

    #[error("交互失败: {0}")]
    Interact(String),

    #[error("已取消")]
    Cancelled,
}

impl StepError {
    /// 错误类别标签（写入结果节点）
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::System(_) => "system_error",
            StepError::PreScript { .. } => "pre_script_error",
            StepError::Execute(_) => "execute_error",
            StepError::Response(_) => "response_error",
            StepError::PostScript { .. } => "post_script_error",
            StepError::Assignment { .. } => "assignment_error",
            StepError::Assert { .. } => "assert_error",
            StepError::Combination { .. } => "combination_error",
            StepError::Interact(_) => "interact_error",
            StepError::Cancelled => "cancelled",
        }
    }

    /// 展开为结果节点中的错误条目
    pub fn messages(&self) -> Vec<String> {
        match self {
            StepError::Assert { failures } => failures
                .iter()
                .map(|f| format!("断言 #{} 失败: {}", f.index, f.message))
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

fn format_asserts(failures: &[AssertFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{}", f.index))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_children(failures: &[ChildFailure]) -> String {
    failures
        .iter()
        .map(|f| match f.group {
            Some(group) => format!("({}, {})", group, f.index),
            None => format!("({})", f.index),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
