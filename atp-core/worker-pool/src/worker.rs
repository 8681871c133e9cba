//! 工作者 actor

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::message::{task_channel, TaskAssignment, TaskEndpoint, TaskEvent, TaskLink};
use crate::{PoolError, Result};

/// 在工作者内执行一个任务
///
/// 实现方通过 `endpoint` 发送事件、接收命令，结束前应发送 `Done`。
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, assignment: TaskAssignment, endpoint: TaskEndpoint);
}

/// 工作者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// 空闲，可被获取
    Idle,
    /// 已被获取
    Busy,
    /// 正在终止
    Dying,
}

pub(crate) enum WorkerCommand {
    Execute {
        assignment: TaskAssignment,
        endpoint: TaskEndpoint,
    },
    Shutdown,
}

struct CurrentTask {
    task_id: usize,
    run_timeout: Duration,
    dispatched_at: Instant,
    events: async_channel::Sender<TaskEvent>,
}

struct WorkerStatus {
    state: WorkerState,
    last_seen: Instant,
    idle_since: Instant,
    current: Option<CurrentTask>,
}

/// 巡检用的状态快照
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusView {
    pub state: WorkerState,
    pub last_seen: Instant,
    pub idle_since: Instant,
    /// (下发时间, 运行超时)
    pub running: Option<(Instant, Duration)>,
}

pub(crate) struct WorkerShared {
    status: Mutex<WorkerStatus>,
}

impl WorkerShared {
    fn new(state: WorkerState) -> Self {
        let now = Instant::now();
        Self {
            status: Mutex::new(WorkerStatus {
                state,
                last_seen: now,
                idle_since: now,
                current: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.lock().last_seen = Instant::now();
    }

    fn finish_task(&self) {
        self.lock().current = None;
    }

    pub fn view(&self) -> StatusView {
        let status = self.lock();
        StatusView {
            state: status.state,
            last_seen: status.last_seen,
            idle_since: status.idle_since,
            running: status
                .current
                .as_ref()
                .map(|c| (c.dispatched_at, c.run_timeout)),
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        let mut status = self.lock();
        if state == WorkerState::Idle && status.state != WorkerState::Idle {
            status.idle_since = Instant::now();
        }
        status.state = state;
    }

    pub fn has_task(&self) -> bool {
        self.lock().current.is_some()
    }

    /// 向当前任务转发一条合成事件
    pub fn relay(&self, event: TaskEvent) -> bool {
        match &self.lock().current {
            Some(current) => current.events.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn current_task(&self) -> Option<usize> {
        self.lock().current.as_ref().map(|c| c.task_id)
    }
}

/// 工作者句柄（调度器持有）
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    control: async_channel::Sender<WorkerCommand>,
    pub(crate) shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.view().state
    }

    /// 当前执行的任务
    pub fn current_task(&self) -> Option<usize> {
        self.shared.current_task()
    }

    /// 下发任务，返回该任务的专属通道
    pub fn dispatch(&self, assignment: TaskAssignment) -> Result<TaskLink> {
        let (link, endpoint) = task_channel(assignment.task_id);
        {
            let mut status = self.shared.lock();
            match status.state {
                WorkerState::Busy => {}
                WorkerState::Idle | WorkerState::Dying => {
                    return Err(PoolError::WorkerUnavailable(self.id))
                }
            }
            if status.current.is_some() {
                return Err(PoolError::WorkerBusy(self.id));
            }
            status.current = Some(CurrentTask {
                task_id: assignment.task_id,
                run_timeout: assignment.run_timeout(),
                dispatched_at: Instant::now(),
                events: endpoint.event_sender(),
            });
        }

        debug!("工作者 #{} 接收任务 {}", self.id, assignment.task_id);
        if self
            .control
            .try_send(WorkerCommand::Execute {
                assignment,
                endpoint,
            })
            .is_err()
        {
            self.shared.finish_task();
            return Err(PoolError::WorkerUnavailable(self.id));
        }
        Ok(link)
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.control.try_send(WorkerCommand::Shutdown);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// 启动一个工作者（初始状态为已获取）
pub(crate) fn spawn_worker(
    id: usize,
    runner: Arc<dyn TaskRunner>,
    heartbeat: Duration,
) -> (WorkerHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = async_channel::unbounded();
    let shared = Arc::new(WorkerShared::new(WorkerState::Busy));
    let handle = WorkerHandle {
        id,
        control: control_tx,
        shared: Arc::clone(&shared),
    };

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => shared.touch(),
                command = control_rx.recv() => match command {
                    Ok(WorkerCommand::Execute { assignment, endpoint }) => {
                        let task_id = assignment.task_id;
                        let run = runner.run(assignment, endpoint);
                        tokio::pin!(run);
                        // 心跳与任务在同一个 actor 内交替推进
                        loop {
                            tokio::select! {
                                _ = &mut run => break,
                                _ = ticker.tick() => shared.touch(),
                            }
                        }
                        shared.finish_task();
                        debug!("工作者 #{} 完成任务 {}", id, task_id);
                    }
                    Ok(WorkerCommand::Shutdown) | Err(_) => break,
                },
            }
        }
        info!("工作者 #{} 已退出", id);
    });

    (handle, join)
}
