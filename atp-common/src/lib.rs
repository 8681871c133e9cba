//! ATP 通用类型定义
//!
//! 此 crate 包含调度器、工作池和执行器之间共享的类型：
//! 步骤/运行状态、任务模式、进度快照以及交互提示。
//! 所有类型均可序列化，可以安全地跨越工作者通道传递。

use serde::{Deserialize, Serialize};

/// 步骤状态
///
/// 状态流转: `Wait → Running → {Done, Error, Skip, Interact → Done|Error}`。
/// `Wait` 和 `Skip` 不会从 `Running` 进入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// 等待执行（初始状态，也用于被旁路的步骤）
    #[default]
    Wait,
    /// 执行中
    Running,
    /// 执行成功
    Done,
    /// 执行失败
    Error,
    /// 已跳过（禁用、条件未命中或数据行跳过）
    Skip,
    /// 等待交互应答
    Interact,
}

impl StepStatus {
    /// 全部状态，顺序与计数器下标一致
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Wait,
        StepStatus::Running,
        StepStatus::Done,
        StepStatus::Error,
        StepStatus::Skip,
        StepStatus::Interact,
    ];

    /// 线上编码
    pub fn code(&self) -> u8 {
        match self {
            Self::Wait => 0,
            Self::Running => 1,
            Self::Done => 2,
            Self::Error => 3,
            Self::Skip => 4,
            Self::Interact => 5,
        }
    }

    /// 从线上编码解析
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// 计数器下标
    pub fn index(&self) -> usize {
        self.code() as usize
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Skip)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Wait => "WAIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
            Self::Interact => "INTERACT",
        };
        f.write_str(name)
    }
}

/// 运行状态（一次运行或一个批次任务）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Wait,
    Running,
    Done,
    Error,
    Skip,
    Timeout,
    Cancel,
}

impl RunStatus {
    /// 线上编码（与 [`StepStatus`] 共用 0-5 区间）
    pub fn code(&self) -> u8 {
        match self {
            Self::Wait => 0,
            Self::Running => 1,
            Self::Done => 2,
            Self::Error => 3,
            Self::Skip => 4,
            Self::Timeout => 6,
            Self::Cancel => 7,
        }
    }

    /// 从线上编码解析
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Wait),
            1 => Some(Self::Running),
            2 => Some(Self::Done),
            3 => Some(Self::Error),
            4 => Some(Self::Skip),
            6 => Some(Self::Timeout),
            7 => Some(Self::Cancel),
            _ => None,
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Wait | Self::Running)
    }

    /// 失败后是否允许重试（除 Done/Skip/Cancel 外的终止状态）
    pub fn is_retryable(&self) -> bool {
        self.is_terminal() && !matches!(self, Self::Done | Self::Skip | Self::Cancel)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Wait => "WAIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
            Self::Timeout => "TIMEOUT",
            Self::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}

/// 任务模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// 同步任务：与其他任务互斥
    Sync,
    /// 异步任务：可与相邻异步任务并发
    #[default]
    Async,
}

impl TaskMode {
    pub const SYNC_BIT: u32 = 0x1;
    pub const ASYNC_BIT: u32 = 0x2;

    /// 模式位掩码
    pub fn bits(&self) -> u32 {
        match self {
            Self::Sync => Self::SYNC_BIT,
            Self::Async => Self::ASYNC_BIT,
        }
    }

    /// 从位掩码解析，SYNC 位优先
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & Self::SYNC_BIT != 0 {
            Some(Self::Sync)
        } else if bits & Self::ASYNC_BIT != 0 {
            Some(Self::Async)
        } else {
            None
        }
    }
}

/// 各状态计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusCounters {
    pub wait: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub skip: usize,
    pub interact: usize,
}

impl StatusCounters {
    fn slot(&mut self, status: StepStatus) -> &mut usize {
        match status {
            StepStatus::Wait => &mut self.wait,
            StepStatus::Running => &mut self.running,
            StepStatus::Done => &mut self.done,
            StepStatus::Error => &mut self.error,
            StepStatus::Skip => &mut self.skip,
            StepStatus::Interact => &mut self.interact,
        }
    }

    /// 读取某个状态的计数
    pub fn get(&self, status: StepStatus) -> usize {
        match status {
            StepStatus::Wait => self.wait,
            StepStatus::Running => self.running,
            StepStatus::Done => self.done,
            StepStatus::Error => self.error,
            StepStatus::Skip => self.skip,
            StepStatus::Interact => self.interact,
        }
    }

    /// 新增一个节点
    pub fn add(&mut self, status: StepStatus) {
        *self.slot(status) += 1;
    }

    /// 状态迁移：旧状态减一、新状态加一
    pub fn transition(&mut self, from: StepStatus, to: StepStatus) {
        if from == to {
            return;
        }
        let old = self.slot(from);
        *old = old.saturating_sub(1);
        *self.slot(to) += 1;
    }

    /// 节点总数
    pub fn total(&self) -> usize {
        self.wait + self.running + self.done + self.error + self.skip + self.interact
    }

    /// 已结束的节点数
    pub fn finished(&self) -> usize {
        self.done + self.error + self.skip
    }

    /// 完成比例 (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.finished() as f64 / total as f64
    }
}

/// 运行进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 运行状态
    pub status: RunStatus,

    /// 完成比例 (0.0 - 1.0)
    pub progress: f64,

    /// 各状态计数
    pub counters: StatusCounters,

    /// 已分配的全局步骤序号数
    pub steps_started: usize,
}

/// 交互提示类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    /// 确认（yes/no）
    #[default]
    Confirm,
    /// 文本输入
    Input,
}

/// 交互提示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractPrompt {
    /// 提示类型
    #[serde(default)]
    pub kind: PromptKind,

    /// 提示文本（支持变量替换）
    pub message: String,

    /// 应答写入的变量名（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,

    /// 输入类提示的期望值（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

/// 步骤进入 INTERACT 状态时向调用方发出的询问
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractAsk {
    /// 全局步骤序号（应答按此键路由）
    pub step_index: usize,

    /// 步骤 ID
    pub step_id: String,

    /// 已完成变量替换的提示
    pub prompts: Vec<InteractPrompt>,
}

/// 运行过程中透传给调用方的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMessage {
    /// 进度更新
    Progress(ProgressSnapshot),

    /// 单个步骤状态变化
    StepUpdate { step_id: String, status: StepStatus },

    /// 查询应答
    QueryReply(ProgressSnapshot),

    /// 错误通知（例如工作者失去响应）
    Error { message: String },
}
