//! 任务消息与专属通道

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use atp_common::{InteractAsk, RunMessage, RunStatus};

use crate::{PoolError, Result};

/// 下发给工作者的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// 任务在批次中的位置
    pub task_id: usize,

    /// 第几次尝试（从 0 开始）
    pub attempt: u32,

    /// 压缩后的运行定义
    pub payload: Vec<u8>,

    /// 批次共享的环境变量
    #[serde(default)]
    pub env: Map<String, Value>,

    /// 批次选项位
    #[serde(default)]
    pub options: u32,

    /// 运行超时（毫秒），用于工作池判定强制终止
    pub run_timeout_ms: u64,
}

impl TaskAssignment {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// 调度器 → 工作者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TaskCommand {
    /// 查询进度
    Query,
    /// 交互应答
    Interact {
        step_index: usize,
        answers: Vec<String>,
    },
    /// 取消运行
    Cancel,
}

/// 工作者 → 调度器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TaskEvent {
    Message(RunMessage),
    SetGlobalVariable { name: String, value: Value },
    InteractAsk(InteractAsk),
    /// 运行结束，附带二进制结果
    Done { status: RunStatus, payload: Vec<u8> },
    /// 工作者异常退出或被强制终止
    Exit { reason: String },
}

impl TaskEvent {
    /// 是否为任务的最后一条事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Done { .. } | TaskEvent::Exit { .. })
    }
}

/// 调度器一侧的任务通道
#[derive(Debug, Clone)]
pub struct TaskLink {
    task_id: usize,
    commands: async_channel::Sender<TaskCommand>,
    events: async_channel::Receiver<TaskEvent>,
}

impl TaskLink {
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// 发送命令
    pub async fn send(&self, command: TaskCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PoolError::ChannelClosed)
    }

    /// 接收下一条事件；通道关闭时返回 `None`
    pub async fn recv(&self) -> Option<TaskEvent> {
        self.events.recv().await.ok()
    }

    /// 事件接收端（可克隆，用于转发）
    pub fn events(&self) -> async_channel::Receiver<TaskEvent> {
        self.events.clone()
    }

    pub fn commands(&self) -> async_channel::Sender<TaskCommand> {
        self.commands.clone()
    }
}

/// 工作者一侧的任务通道
#[derive(Debug, Clone)]
pub struct TaskEndpoint {
    task_id: usize,
    commands: async_channel::Receiver<TaskCommand>,
    events: async_channel::Sender<TaskEvent>,
}

impl TaskEndpoint {
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    /// 发送事件；调度器已放弃该任务时静默丢弃
    pub fn emit(&self, event: TaskEvent) {
        if self.events.try_send(event).is_err() {
            tracing::debug!("任务 {} 的事件通道已关闭", self.task_id);
        }
    }

    /// 接收下一条命令；通道关闭时返回 `None`
    pub async fn recv_command(&self) -> Option<TaskCommand> {
        self.commands.recv().await.ok()
    }

    /// 取出已到达的命令，不等待
    pub fn try_recv_command(&self) -> Option<TaskCommand> {
        self.commands.try_recv().ok()
    }

    pub(crate) fn event_sender(&self) -> async_channel::Sender<TaskEvent> {
        self.events.clone()
    }
}

/// 为一个任务创建专属的双向通道
pub fn task_channel(task_id: usize) -> (TaskLink, TaskEndpoint) {
    let (command_tx, command_rx) = async_channel::unbounded();
    let (event_tx, event_rx) = async_channel::unbounded();
    (
        TaskLink {
            task_id,
            commands: command_tx,
            events: event_rx,
        },
        TaskEndpoint {
            task_id,
            commands: command_rx,
            events: event_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_channel_both_directions() {
        let (link, endpoint) = task_channel(3);
        assert_eq!(link.task_id(), 3);

        link.send(TaskCommand::Cancel).await.unwrap();
        assert_eq!(endpoint.recv_command().await, Some(TaskCommand::Cancel));

        endpoint.emit(TaskEvent::Exit {
            reason: "bye".to_string(),
        });
        let event = link.recv().await.unwrap();
        assert!(event.is_terminal());

        drop(endpoint);
        assert_eq!(link.recv().await, None);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = TaskEvent::SetGlobalVariable {
            name: "token".to_string(),
            value: Value::from("abc"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "set-global-variable");

        let command: TaskCommand =
            serde_json::from_str(r#"{"command":"interact","step_index":2,"answers":["y"]}"#)
                .unwrap();
        assert_eq!(
            command,
            TaskCommand::Interact {
                step_index: 2,
                answers: vec!["y".to_string()]
            }
        );
    }
}
