//! 工作者内的运行桥接
//!
//! 把任务负载解码为运行定义，交给 [`RunOrchestrator`] 执行，
//! 同时把任务命令翻译为运行控制、把运行事件翻译为任务事件。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use atp_common::{RunMessage, RunStatus};
use atp_executor::{
    decompress_json, minimal_error_payload, AdapterRegistry, FileCache, RunControl, RunDefinition,
    RunEvent, RunOptions, RunOrchestrator, ScriptSandbox, ThrottlePolicy, Variables,
};
use atp_worker_pool::{TaskAssignment, TaskCommand, TaskEndpoint, TaskEvent, TaskRunner};

/// 使用执行引擎运行任务
pub struct EngineRunner {
    registry: Arc<AdapterRegistry>,
    options: RunOptions,
    throttle: ThrottlePolicy,
    sandbox: Option<Arc<dyn ScriptSandbox>>,
    file_cache: Option<Arc<FileCache>>,
}

impl EngineRunner {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            options: RunOptions::default(),
            throttle: ThrottlePolicy::default(),
            sandbox: None,
            file_cache: None,
        }
    }

    /// 基础运行选项，批次选项位在其上生效
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_file_cache(mut self, cache: Arc<FileCache>) -> Self {
        self.file_cache = Some(cache);
        self
    }

    fn orchestrator(
        &self,
        definition: RunDefinition,
        assignment: &TaskAssignment,
        events: async_channel::Sender<RunEvent>,
    ) -> RunOrchestrator {
        let options = self.options.clone().with_option_bits(assignment.options);
        let mut orchestrator = RunOrchestrator::new(definition, Arc::clone(&self.registry))
            .with_options(options)
            .with_throttle(self.throttle.clone())
            .with_env(Variables::from_map(assignment.env.clone()))
            .with_events(events);
        if let Some(sandbox) = &self.sandbox {
            orchestrator = orchestrator.with_sandbox(Arc::clone(sandbox));
        }
        if let Some(cache) = &self.file_cache {
            orchestrator = orchestrator.with_file_cache(Arc::clone(cache));
        }
        orchestrator
    }
}

fn apply_command(control: &RunControl, endpoint: &TaskEndpoint, command: TaskCommand) {
    match command {
        TaskCommand::Query => endpoint.emit(TaskEvent::Message(RunMessage::QueryReply(
            control.snapshot(),
        ))),
        TaskCommand::Interact {
            step_index,
            answers,
        } => {
            if !control.answer(step_index, answers) {
                warn!("任务 {} 没有步骤 {} 的交互等待", endpoint.task_id(), step_index);
            }
        }
        TaskCommand::Cancel => {
            info!("任务 {} 收到取消命令", endpoint.task_id());
            control.cancel();
        }
    }
}

fn to_task_event(event: RunEvent) -> TaskEvent {
    match event {
        RunEvent::Message(message) => TaskEvent::Message(message),
        RunEvent::SetGlobalVariable { name, value } => TaskEvent::SetGlobalVariable { name, value },
        RunEvent::InteractAsk(ask) => TaskEvent::InteractAsk(ask),
    }
}

#[async_trait]
impl TaskRunner for EngineRunner {
    async fn run(&self, assignment: TaskAssignment, endpoint: TaskEndpoint) {
        let task_id = assignment.task_id;
        let definition: RunDefinition = match decompress_json(&assignment.payload) {
            Ok(definition) => definition,
            Err(e) => {
                warn!("任务 {} 的运行定义无法解码: {}", task_id, e);
                let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
                let payload = minimal_error_payload(
                    self.options.engine_version,
                    &format!("task-{}", task_id),
                    now,
                    now,
                    &format!("运行定义无法解码: {}", e),
                );
                endpoint.emit(TaskEvent::Done {
                    status: RunStatus::Error,
                    payload,
                });
                return;
            }
        };

        let (event_tx, event_rx) = async_channel::unbounded();
        let orchestrator = self.orchestrator(definition, &assignment, event_tx);
        let control = orchestrator.control();
        debug!("任务 {} 第 {} 次执行，运行 {}", task_id, assignment.attempt, orchestrator.run_id());

        // 分发前补发的命令（如取消）必须在运行开始前生效
        while let Some(command) = endpoint.try_recv_command() {
            apply_command(&control, &endpoint, command);
        }

        let run = orchestrator.run();
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                biased;
                Some(command) = endpoint.recv_command() => apply_command(&control, &endpoint, command),
                outcome = &mut run => break outcome,
                Ok(event) = event_rx.recv() => endpoint.emit(to_task_event(event)),
            }
        };

        // 运行结束后残留的事件
        while let Ok(event) = event_rx.try_recv() {
            endpoint.emit(to_task_event(event));
        }

        endpoint.emit(TaskEvent::Done {
            status: outcome.status,
            payload: outcome.payload,
        });
    }
}
