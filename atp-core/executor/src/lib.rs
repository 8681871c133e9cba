//! ATP 执行器
//!
//! 单次运行的执行引擎：按步骤树顺序执行、收集结构化结果、
//! 推送进度，并将结果序列化为二进制格式。

pub mod adapter;
pub mod assertion;
pub mod builtins;
pub mod codec;
pub mod combination;
pub mod context;
pub mod controller;
pub mod definition;
pub mod error;
pub mod file_cache;
pub mod orchestrator;
pub mod registry;
pub mod result_tree;
pub mod sandbox;
pub mod throttle;
pub mod variables;

pub use adapter::{AdapterBuilder, AdapterError, StepAdapter, StepContext};
pub use codec::{
    compress_json, decompress_json, encode_run_result, minimal_error_payload, DecodedRunResult,
    RunResultHeader, RunResultParts,
};
pub use context::{
    DatasetCounters, ExtraConfig, InteractBus, RunContext, RunEvent, RunOptions,
    OPTION_IGNORE_ERRORS, OPTION_NO_DETAIL,
};
pub use definition::{
    AssertDecl, AssertOp, AssignScope, Assignment, CombinationKind, ResourceRef, RunDefinition,
    StepChildren, StepDefinition, ValueSource,
};
pub use error::{AssertFailure, ChildFailure, StepError};
pub use file_cache::FileCache;
pub use orchestrator::{RunControl, RunOrchestrator, RunOutcome};
pub use registry::AdapterRegistry;
pub use result_tree::{IndexNode, IndexTree, NodeBase, NodeSteps, ResultNode, ResultTree, SkipReason};
pub use sandbox::{ExpressionSandbox, ScriptHook, ScriptSandbox};
pub use throttle::{Throttle, ThrottlePolicy, ThrottleTier};
pub use variables::{SharedVariables, VariableScope, Variables};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("运行定义加载失败: {0}")]
    DefinitionLoadFailed(String),

    #[error("适配器 {0} 未注册")]
    AdapterNotFound(String),

    #[error("适配器 {0} 已注册")]
    AdapterAlreadyRegistered(String),

    #[error("无效的数据标记")]
    InvalidMarker,

    #[error("不支持的协议版本: {0}")]
    UnsupportedVersion(u8),

    #[error("数据不完整: {0}")]
    Truncated(String),

    #[error("编解码错误: {0}")]
    Codec(String),

    #[error("文件缓存错误: {0}")]
    FileCache(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

impl From<serde_json::Error> for ExecutorError {
    fn from(e: serde_json::Error) -> Self {
        ExecutorError::SerdeError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
