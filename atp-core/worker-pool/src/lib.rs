//! ATP 工作池
//!
//! 每个工作者是一个独立的 actor 任务，一次只持有一个运行。
//! 调度器与工作者之间只传递可序列化的消息：
//! 控制通道负责下发任务，每个任务另有一条专属的双向通道。

pub mod config;
pub mod message;
pub mod pool;
pub mod worker;

pub use config::PoolConfig;
pub use message::{task_channel, TaskAssignment, TaskCommand, TaskEndpoint, TaskEvent, TaskLink};
pub use pool::{PoolStats, WorkerPool};
pub use worker::{TaskRunner, WorkerHandle, WorkerState};

use thiserror::Error;

/// 工作池错误
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("工作池已关闭")]
    ShutDown,

    #[error("工作者 {0} 不可用")]
    WorkerUnavailable(usize),

    #[error("工作者 {0} 正在执行任务")]
    WorkerBusy(usize),

    #[error("任务通道已关闭")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, PoolError>;
