//! ATP 调度器
//!
//! 把一个批次中的独立运行分发到工作池：
//! - SYNC 任务独占执行，ASYNC 任务在容量内并发
//! - 失败的任务按配置重试
//! - 取消、交互应答和进度查询转发给对应的工作者

pub mod batch;
pub mod config;
pub mod runner;
pub mod scheduler;

pub use batch::{Batch, BatchRun, SharedContext, BATCH_HEADER_LEN, BATCH_MARKER};
pub use config::SchedulerConfig;
pub use runner::EngineRunner;
pub use scheduler::{BatchHandle, Scheduler, SchedulerEvent};

use atp_executor::ExecutorError;
use atp_worker_pool::PoolError;
use thiserror::Error;

/// 调度器错误
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("无效的批次标记")]
    InvalidMarker,

    #[error("不支持的批次版本: {0}")]
    UnsupportedVersion(u8),

    #[error("批次数据不完整: {0}")]
    Truncated(String),

    #[error("无效的任务模式: {0:#x}")]
    InvalidMode(u32),

    #[error("批次已结束")]
    BatchClosed,

    #[error("任务 {0} 不存在")]
    TaskNotFound(usize),

    #[error("执行器错误: {0}")]
    Executor(#[from] ExecutorError),

    #[error("工作池错误: {0}")]
    Pool(#[from] PoolError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
