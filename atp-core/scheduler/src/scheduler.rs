//! 批次调度
//!
//! 每个批次由一个独立的 actor 驱动，按提交顺序推进游标：
//! - ASYNC 任务在在途数小于工作池容量时启动
//! - SYNC 任务只在没有在途任务时启动，执行期间不启动其他任务
//! - 队首任务无法启动时整体等待，保证顺序
//!
//! 每个任务的事件按任务序号转发到批次事件流，批次排空后发出 `Summary` 并关闭事件流。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atp_common::{InteractAsk, RunMessage, RunStatus, TaskMode};
use atp_worker_pool::{TaskAssignment, TaskCommand, TaskEvent, TaskLink, WorkerPool};

use crate::batch::{Batch, BatchRun};
use crate::config::SchedulerConfig;
use crate::{Result, SchedulerError};

/// 批次事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    /// 任务已交给工作者
    Started {
        task_id: usize,
        attempt: u32,
        worker_id: usize,
    },
    Message {
        task_id: usize,
        message: RunMessage,
    },
    InteractAsk {
        task_id: usize,
        ask: InteractAsk,
    },
    SetGlobalVariable {
        task_id: usize,
        name: String,
        value: Value,
    },
    /// 工作者异常退出或被强制终止
    Exit {
        task_id: usize,
        reason: String,
    },
    /// 本次执行失败，任务重新排队
    Retry {
        task_id: usize,
        attempt: u32,
        status: RunStatus,
    },
    /// 任务最终结果；未运行过的任务 `payload` 为空
    Done {
        task_id: usize,
        status: RunStatus,
        attempts: u32,
        payload: Vec<u8>,
    },
    /// 批次结束，按任务序号给出最终状态
    Summary { statuses: Vec<RunStatus> },
}

#[derive(Debug)]
enum BatchCommand {
    Cancel(usize),
    CancelAll,
    Interact {
        task_id: usize,
        step_index: usize,
        answers: Vec<String>,
    },
    Query(usize),
}

/// 批次控制句柄
#[derive(Debug, Clone)]
pub struct BatchHandle {
    commands: mpsc::UnboundedSender<BatchCommand>,
}

impl BatchHandle {
    fn send(&self, command: BatchCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::BatchClosed)
    }

    /// 取消单个任务：排队中的直接标记为取消，执行中的转发取消命令
    pub fn cancel(&self, task_id: usize) -> Result<()> {
        self.send(BatchCommand::Cancel(task_id))
    }

    /// 取消全部任务
    pub fn cancel_all(&self) -> Result<()> {
        self.send(BatchCommand::CancelAll)
    }

    /// 投递交互应答
    pub fn interact(&self, task_id: usize, step_index: usize, answers: Vec<String>) -> Result<()> {
        self.send(BatchCommand::Interact {
            task_id,
            step_index,
            answers,
        })
    }

    /// 查询进度，应答以 `Message` 事件返回
    pub fn query(&self, task_id: usize) -> Result<()> {
        self.send(BatchCommand::Query(task_id))
    }
}

/// 调度器
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>, config: SchedulerConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 提交批次，返回控制句柄和事件流
    pub fn submit(&self, batch: Batch) -> (BatchHandle, async_channel::Receiver<SchedulerEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = async_channel::unbounded();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = BatchActor::new(
            batch,
            Arc::clone(&self.pool),
            self.config.clone(),
            event_tx,
            internal_tx,
        );
        tokio::spawn(actor.run(command_rx, internal_rx));

        (
            BatchHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }
}

struct TaskSlot {
    run: BatchRun,
    /// 运行定义声明的超时
    timeout_ms: Option<u64>,
    status: RunStatus,
    attempts: u32,
    /// 取消后不再重试；分发前取消则不占用工作者
    cancel: CancellationToken,
    link: Option<TaskLink>,
}

enum Internal {
    Dispatched {
        task_id: usize,
        attempt: u32,
        worker_id: usize,
        link: TaskLink,
    },
    Event {
        task_id: usize,
        attempt: u32,
        event: TaskEvent,
    },
    Failed {
        task_id: usize,
        attempt: u32,
        reason: String,
    },
}

struct BatchActor {
    pool: Arc<WorkerPool>,
    config: SchedulerConfig,
    env: Map<String, Value>,
    options: u32,
    tasks: Vec<TaskSlot>,
    cursor: usize,
    retries: VecDeque<usize>,
    in_flight: usize,
    sync_in_flight: bool,
    stopped: bool,
    events: async_channel::Sender<SchedulerEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl BatchActor {
    fn new(
        batch: Batch,
        pool: Arc<WorkerPool>,
        config: SchedulerConfig,
        events: async_channel::Sender<SchedulerEvent>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let Batch { context, runs } = batch;
        let tasks = runs
            .into_iter()
            .map(|run| TaskSlot {
                timeout_ms: run.definition().ok().and_then(|d| d.timeout_ms),
                run,
                status: RunStatus::Wait,
                attempts: 0,
                cancel: CancellationToken::new(),
                link: None,
            })
            .collect();

        Self {
            pool,
            config,
            env: context.env,
            options: context.options,
            tasks,
            cursor: 0,
            retries: VecDeque::new(),
            in_flight: 0,
            sync_in_flight: false,
            stopped: false,
            events,
            internal,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BatchCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("批次开始，共 {} 个任务", self.tasks.len());

        loop {
            self.start_ready();
            if self.drained() {
                break;
            }
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command),
                Some(message) = internal.recv() => self.handle_internal(message),
                else => break,
            }
        }

        let statuses: Vec<RunStatus> = self.tasks.iter().map(|t| t.status).collect();
        info!("批次结束: {:?}", statuses);
        self.emit(SchedulerEvent::Summary { statuses });
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.events.try_send(event).is_err() {
            debug!("批次事件流已关闭");
        }
    }

    fn drained(&self) -> bool {
        self.in_flight == 0 && self.retries.is_empty() && self.cursor >= self.tasks.len()
    }

    /// 下一个候选任务：重试队列优先，其次游标处第一个未结束的任务
    fn next_candidate(&mut self) -> Option<(usize, bool)> {
        if let Some(&task_id) = self.retries.front() {
            return Some((task_id, true));
        }
        while self.cursor < self.tasks.len() && self.tasks[self.cursor].status.is_terminal() {
            self.cursor += 1;
        }
        (self.cursor < self.tasks.len()).then_some((self.cursor, false))
    }

    fn start_ready(&mut self) {
        let capacity = self.pool.config().max_workers.max(1);
        while !self.sync_in_flight {
            let Some((task_id, from_retry)) = self.next_candidate() else {
                break;
            };
            let can_start = match self.tasks[task_id].run.mode {
                TaskMode::Sync => self.in_flight == 0,
                TaskMode::Async => self.in_flight < capacity,
            };
            if !can_start {
                break;
            }
            if from_retry {
                self.retries.pop_front();
            } else {
                self.cursor += 1;
            }
            self.start(task_id);
        }
    }

    fn start(&mut self, task_id: usize) {
        let run_timeout_ms = self.config.run_timeout_ms;
        let env = self.env.clone();
        let options = self.options;

        let slot = &mut self.tasks[task_id];
        let attempt = slot.attempts;
        slot.attempts += 1;
        slot.status = RunStatus::Running;
        let assignment = TaskAssignment {
            task_id,
            attempt,
            payload: slot.run.payload.clone(),
            env,
            options,
            run_timeout_ms: slot.timeout_ms.unwrap_or(run_timeout_ms),
        };

        self.in_flight += 1;
        if slot.run.mode == TaskMode::Sync {
            self.sync_in_flight = true;
        }
        debug!(task_id, attempt, "分发任务");
        tokio::spawn(drive_task(
            Arc::clone(&self.pool),
            assignment,
            slot.cancel.clone(),
            self.internal.clone(),
        ));
    }

    fn is_current(&self, task_id: usize, attempt: u32) -> bool {
        self.tasks
            .get(task_id)
            .map(|slot| slot.status == RunStatus::Running && slot.attempts == attempt + 1)
            .unwrap_or(false)
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Dispatched {
                task_id,
                attempt,
                worker_id,
                link,
            } => {
                if !self.is_current(task_id, attempt) {
                    return;
                }
                info!(task_id, worker_id, "任务已交给工作者");
                let slot = &mut self.tasks[task_id];
                if slot.cancel.is_cancelled()
                    && link.commands().try_send(TaskCommand::Cancel).is_err()
                {
                    warn!(task_id, "取消命令发送失败");
                }
                slot.link = Some(link);
                self.emit(SchedulerEvent::Started {
                    task_id,
                    attempt,
                    worker_id,
                });
            }
            Internal::Event {
                task_id,
                attempt,
                event,
            } => {
                if self.is_current(task_id, attempt) {
                    self.handle_task_event(task_id, event);
                }
            }
            Internal::Failed {
                task_id,
                attempt,
                reason,
            } => {
                if !self.is_current(task_id, attempt) {
                    return;
                }
                warn!(task_id, "任务分发失败: {}", reason);
                self.emit(SchedulerEvent::Exit { task_id, reason });
                self.finish_attempt(task_id, RunStatus::Error, Vec::new());
            }
        }
    }

    fn handle_task_event(&mut self, task_id: usize, event: TaskEvent) {
        match event {
            TaskEvent::Message(message) => self.emit(SchedulerEvent::Message { task_id, message }),
            TaskEvent::InteractAsk(ask) => self.emit(SchedulerEvent::InteractAsk { task_id, ask }),
            TaskEvent::SetGlobalVariable { name, value } => {
                debug!(task_id, "更新全局变量 {}", name);
                self.env.insert(name.clone(), value.clone());
                self.emit(SchedulerEvent::SetGlobalVariable {
                    task_id,
                    name,
                    value,
                });
            }
            TaskEvent::Done { status, payload } => self.finish_attempt(task_id, status, payload),
            TaskEvent::Exit { reason } => {
                warn!(task_id, "工作者退出: {}", reason);
                self.emit(SchedulerEvent::Exit { task_id, reason });
                self.finish_attempt(task_id, RunStatus::Error, Vec::new());
            }
        }
    }

    fn finish_attempt(&mut self, task_id: usize, status: RunStatus, payload: Vec<u8>) {
        self.in_flight = self.in_flight.saturating_sub(1);

        let slot = &mut self.tasks[task_id];
        slot.link = None;
        if slot.run.mode == TaskMode::Sync {
            self.sync_in_flight = false;
        }
        let attempts = slot.attempts;

        let retry = status.is_retryable()
            && !slot.cancel.is_cancelled()
            && !self.stopped
            && attempts <= self.config.retry_count;
        if retry {
            info!(task_id, "第 {} 次执行结果为 {}，重新排队", attempts, status);
            slot.status = RunStatus::Wait;
            self.retries.push_back(task_id);
            self.emit(SchedulerEvent::Retry {
                task_id,
                attempt: attempts,
                status,
            });
            return;
        }

        slot.status = status;
        info!(task_id, "任务结束: {} (执行 {} 次)", status, attempts);
        self.emit(SchedulerEvent::Done {
            task_id,
            status,
            attempts,
            payload,
        });
    }

    fn handle_command(&mut self, command: BatchCommand) {
        match command {
            BatchCommand::Cancel(task_id) => self.cancel(task_id),
            BatchCommand::CancelAll => {
                info!("取消批次中的全部任务");
                self.stopped = true;
                for task_id in 0..self.tasks.len() {
                    self.cancel(task_id);
                }
            }
            BatchCommand::Interact {
                task_id,
                step_index,
                answers,
            } => self.forward(
                task_id,
                TaskCommand::Interact {
                    step_index,
                    answers,
                },
            ),
            BatchCommand::Query(task_id) => self.forward(task_id, TaskCommand::Query),
        }
    }

    fn cancel(&mut self, task_id: usize) {
        let Some(slot) = self.tasks.get_mut(task_id) else {
            warn!("取消不存在的任务 {}", task_id);
            return;
        };
        if slot.cancel.is_cancelled() || slot.status.is_terminal() {
            return;
        }
        slot.cancel.cancel();

        if slot.status == RunStatus::Running {
            // 尚未拿到通道时，由 Dispatched 补发
            if let Some(link) = &slot.link {
                if link.commands().try_send(TaskCommand::Cancel).is_err() {
                    warn!(task_id, "取消命令发送失败");
                }
            }
            return;
        }

        slot.status = RunStatus::Cancel;
        let attempts = slot.attempts;
        self.retries.retain(|id| *id != task_id);
        info!(task_id, "排队中的任务已取消");
        self.emit(SchedulerEvent::Done {
            task_id,
            status: RunStatus::Cancel,
            attempts,
            payload: Vec::new(),
        });
    }

    fn forward(&self, task_id: usize, command: TaskCommand) {
        match self.tasks.get(task_id).and_then(|slot| slot.link.as_ref()) {
            Some(link) => {
                if link.commands().try_send(command).is_err() {
                    warn!(task_id, "命令发送失败");
                }
            }
            None => warn!("任务 {} 未在执行，忽略命令", task_id),
        }
    }
}

/// 获取工作者、下发任务并把任务事件转交给批次 actor
async fn drive_task(
    pool: Arc<WorkerPool>,
    assignment: TaskAssignment,
    cancel: CancellationToken,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let task_id = assignment.task_id;
    let attempt = assignment.attempt;
    let failed = |reason: String| Internal::Failed {
        task_id,
        attempt,
        reason,
    };

    let worker = match pool.acquire().await {
        Ok(worker) => worker,
        Err(e) => {
            let _ = internal.send(failed(e.to_string()));
            return;
        }
    };
    if cancel.is_cancelled() {
        // 等待工作者期间被取消，运行不开始
        info!(task_id, "任务在分发前已取消");
        pool.release(worker).await;
        let _ = internal.send(Internal::Event {
            task_id,
            attempt,
            event: TaskEvent::Done {
                status: RunStatus::Cancel,
                payload: Vec::new(),
            },
        });
        return;
    }
    let link = match worker.dispatch(assignment) {
        Ok(link) => link,
        Err(e) => {
            pool.release(worker).await;
            let _ = internal.send(failed(e.to_string()));
            return;
        }
    };
    let _ = internal.send(Internal::Dispatched {
        task_id,
        attempt,
        worker_id: worker.id(),
        link: link.clone(),
    });

    let mut finished = false;
    // 读到通道关闭为止，此时工作者已清理完当前任务
    while let Some(event) = link.recv().await {
        if finished {
            continue;
        }
        if let TaskEvent::Exit { .. } = event {
            // 工作者已从池中移除
            let _ = internal.send(Internal::Event {
                task_id,
                attempt,
                event,
            });
            return;
        }
        finished = event.is_terminal();
        let _ = internal.send(Internal::Event {
            task_id,
            attempt,
            event,
        });
    }

    if !finished {
        let _ = internal.send(Internal::Event {
            task_id,
            attempt,
            event: TaskEvent::Exit {
                reason: format!("任务 {} 的通道意外关闭", task_id),
            },
        });
    }
    pool.release(worker).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atp_executor::{decompress_json, RunDefinition};
    use atp_worker_pool::{PoolConfig, TaskEndpoint, TaskRunner};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 按运行变量行事的假执行器
    ///
    /// - `sleep_ms`：执行耗时
    /// - `fail_attempts`：前 N 次返回 Error
    /// - `await_cancel`：等待取消命令
    /// - `set_global`：发出全局变量更新
    ///
    /// 结果负载为下发时的环境变量 JSON。
    #[derive(Default)]
    struct FakeRunner {
        log: Mutex<Vec<(usize, bool)>>,
    }

    #[async_trait]
    impl TaskRunner for FakeRunner {
        async fn run(&self, assignment: TaskAssignment, endpoint: TaskEndpoint) {
            let task_id = assignment.task_id;
            self.log.lock().unwrap().push((task_id, true));

            let definition: RunDefinition = decompress_json(&assignment.payload).unwrap();
            let vars = &definition.variables;

            if let Some(global) = vars.get("set_global") {
                endpoint.emit(TaskEvent::SetGlobalVariable {
                    name: global["name"].as_str().unwrap().to_string(),
                    value: global["value"].clone(),
                });
            }
            if let Some(ms) = vars.get("sleep_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }

            let mut status = RunStatus::Done;
            if vars.get("await_cancel").is_some() {
                while let Some(command) = endpoint.recv_command().await {
                    if command == TaskCommand::Cancel {
                        status = RunStatus::Cancel;
                        break;
                    }
                }
            }
            let fail_attempts = vars.get("fail_attempts").and_then(Value::as_u64).unwrap_or(0);
            if u64::from(assignment.attempt) < fail_attempts {
                status = RunStatus::Error;
            }

            self.log.lock().unwrap().push((task_id, false));
            endpoint.emit(TaskEvent::Done {
                status,
                payload: serde_json::to_vec(&assignment.env).unwrap(),
            });
        }
    }

    fn run(vars: Value) -> RunDefinition {
        RunDefinition {
            name: "fake".to_string(),
            timeout_ms: None,
            variables: vars.as_object().cloned().unwrap_or_default(),
            steps: Vec::new(),
        }
    }

    fn scheduler(max_workers: usize, retry_count: u32) -> (Scheduler, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::default());
        let config = PoolConfig {
            max_workers,
            ..Default::default()
        };
        let pool = Arc::new(WorkerPool::new(config, runner.clone()));
        let scheduler = Scheduler::new(
            pool,
            SchedulerConfig {
                retry_count,
                ..Default::default()
            },
        );
        (scheduler, runner)
    }

    async fn collect(events: async_channel::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut all = Vec::new();
        while let Ok(event) = events.recv().await {
            all.push(event);
        }
        all
    }

    fn summary(events: &[SchedulerEvent]) -> Vec<RunStatus> {
        match events.last() {
            Some(SchedulerEvent::Summary { statuses }) => statuses.clone(),
            other => panic!("最后一条事件不是 Summary: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_task_never_overlaps() {
        let (scheduler, runner) = scheduler(3, 0);
        let modes = [
            TaskMode::Async,
            TaskMode::Async,
            TaskMode::Sync,
            TaskMode::Async,
            TaskMode::Async,
            TaskMode::Async,
            TaskMode::Sync,
            TaskMode::Async,
        ];
        let mut batch = Batch::new(Map::new(), 0);
        for mode in modes {
            batch.push(mode, &run(json!({ "sleep_ms": 20 }))).unwrap();
        }

        let (_handle, events) = scheduler.submit(batch);
        let events = collect(events).await;
        assert_eq!(summary(&events), vec![RunStatus::Done; modes.len()]);

        let log = runner.log.lock().unwrap().clone();
        for (task_id, mode) in modes.iter().enumerate() {
            if *mode != TaskMode::Sync {
                continue;
            }
            let start = log.iter().position(|e| *e == (task_id, true)).unwrap();
            let end = log.iter().position(|e| *e == (task_id, false)).unwrap();
            assert_eq!(end, start + 1, "SYNC 任务 {} 执行期间有其他任务: {:?}", task_id, log);

            // 之前的任务全部结束，之后的任务都在它之后开始
            for other in 0..modes.len() {
                let other_start = log.iter().position(|e| *e == (other, true)).unwrap();
                let other_end = log.iter().position(|e| *e == (other, false)).unwrap();
                if other < task_id {
                    assert!(other_end < start);
                } else if other > task_id {
                    assert!(other_start > end);
                }
            }
        }

        // 开头两个 ASYNC 任务并发执行
        assert!(log[..2].iter().all(|(task_id, start)| *start && *task_id < 2));
    }

    #[tokio::test]
    async fn test_failed_task_retried() {
        let (scheduler, _) = scheduler(2, 2);
        let mut batch = Batch::new(Map::new(), 0);
        batch
            .push(TaskMode::Async, &run(json!({ "fail_attempts": 2 })))
            .unwrap();
        batch
            .push(TaskMode::Async, &run(json!({ "fail_attempts": 9 })))
            .unwrap();

        let (_handle, events) = scheduler.submit(batch);
        let events = collect(events).await;
        assert_eq!(summary(&events), vec![RunStatus::Done, RunStatus::Error]);

        let retries = |id: usize| {
            events
                .iter()
                .filter(|e| matches!(e, SchedulerEvent::Retry { task_id, .. } if *task_id == id))
                .count()
        };
        assert_eq!(retries(0), 2);
        assert_eq!(retries(1), 2);

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::Done { attempts, .. } => Some(*attempts),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![3, 3]);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running_tasks() {
        let (scheduler, runner) = scheduler(1, 3);
        let mut batch = Batch::new(Map::new(), 0);
        batch
            .push(TaskMode::Async, &run(json!({ "await_cancel": true })))
            .unwrap();
        batch.push(TaskMode::Async, &run(json!({}))).unwrap();
        batch.push(TaskMode::Async, &run(json!({}))).unwrap();

        let (handle, events) = scheduler.submit(batch);
        loop {
            if let SchedulerEvent::Started { task_id: 0, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        handle.cancel(1).unwrap();
        handle.cancel(0).unwrap();

        let events = collect(events).await;
        assert_eq!(
            summary(&events),
            vec![RunStatus::Cancel, RunStatus::Cancel, RunStatus::Done]
        );
        assert!(events.contains(&SchedulerEvent::Done {
            task_id: 1,
            status: RunStatus::Cancel,
            attempts: 0,
            payload: Vec::new(),
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::Retry { .. })));

        let log = runner.log.lock().unwrap().clone();
        assert!(!log.iter().any(|(task_id, _)| *task_id == 1));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_batch() {
        let (scheduler, _) = scheduler(1, 0);
        let mut batch = Batch::new(Map::new(), 0);
        batch
            .push(TaskMode::Sync, &run(json!({ "await_cancel": true })))
            .unwrap();
        batch.push(TaskMode::Async, &run(json!({}))).unwrap();

        let (handle, events) = scheduler.submit(batch);
        loop {
            if let SchedulerEvent::Started { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        handle.cancel_all().unwrap();

        let events = collect(events).await;
        assert_eq!(summary(&events), vec![RunStatus::Cancel, RunStatus::Cancel]);
    }

    #[tokio::test]
    async fn test_global_variable_reaches_later_runs() {
        let (scheduler, _) = scheduler(2, 0);
        let mut env = Map::new();
        env.insert("base".to_string(), json!(1));
        let mut batch = Batch::new(env, 0);
        batch
            .push(
                TaskMode::Sync,
                &run(json!({ "set_global": { "name": "token", "value": "abc" } })),
            )
            .unwrap();
        batch.push(TaskMode::Sync, &run(json!({}))).unwrap();

        let (_handle, events) = scheduler.submit(batch);
        let events = collect(events).await;

        assert!(events.contains(&SchedulerEvent::SetGlobalVariable {
            task_id: 0,
            name: "token".to_string(),
            value: json!("abc"),
        }));
        let payload = events
            .iter()
            .find_map(|e| match e {
                SchedulerEvent::Done {
                    task_id: 1,
                    payload,
                    ..
                } => Some(payload.clone()),
                _ => None,
            })
            .unwrap();
        let env: Map<String, Value> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(env["token"], "abc");
        assert_eq!(env["base"], 1);
    }

    #[tokio::test]
    async fn test_empty_batch_summarizes_immediately() {
        let (scheduler, _) = scheduler(1, 0);
        let (handle, events) = scheduler.submit(Batch::default());
        let events = collect(events).await;
        assert_eq!(events, vec![SchedulerEvent::Summary { statuses: vec![] }]);
        assert!(matches!(handle.query(0), Err(SchedulerError::BatchClosed)));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = SchedulerEvent::SetGlobalVariable {
            task_id: 2,
            name: "token".to_string(),
            value: json!("abc"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "set-global-variable");
        assert_eq!(value["task_id"], 2);
    }
}
