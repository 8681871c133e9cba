//! 运行编排器
//!
//! 一次运行的生命周期：准备（适配器 `prepare`、预置 WAIT 节点、拉取资源）→
//! 顺序执行顶层步骤（与全局超时、外部取消竞争）→ 清理 → 序列化结果。
//! 步骤错误不会逃出编排器，任何情况下都会产出一份结果。

use futures_util::future::{poll_immediate, BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use atp_common::{ProgressSnapshot, RunMessage, RunStatus, StepStatus};

use crate::codec::{encode_run_result, minimal_error_payload, RunResultParts};
use crate::context::{ExtraConfig, InteractBus, RunContext, RunEvent, RunOptions};
use crate::controller::{run_sequence, static_children};
use crate::definition::{RunDefinition, StepDefinition};
use crate::error::StepError;
use crate::file_cache::FileCache;
use crate::registry::AdapterRegistry;
use crate::result_tree::{IndexTree, NodeBase, ResultTree};
use crate::sandbox::{ExpressionSandbox, ScriptSandbox};
use crate::throttle::ThrottlePolicy;
use crate::variables::Variables;

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// 运行控制句柄
///
/// 可在运行期间从其他任务取消运行、投递交互应答、查询进度。
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    interact: Arc<InteractBus>,
    tree: Arc<ResultTree>,
    step_counter: Arc<AtomicUsize>,
    status: Arc<Mutex<RunStatus>>,
}

impl RunControl {
    fn new(tree: Arc<ResultTree>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            interact: Arc::new(InteractBus::new()),
            tree,
            step_counter: Arc::new(AtomicUsize::new(0)),
            status: Arc::new(Mutex::new(RunStatus::Wait)),
        }
    }

    /// 请求取消运行
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 投递交互应答
    pub fn answer(&self, step_index: usize, answers: Vec<String>) -> bool {
        self.interact.answer(step_index, answers)
    }

    /// 等待应答的步骤序号
    pub fn pending_interacts(&self) -> Vec<usize> {
        self.interact.pending()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// 当前进度快照
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tree
            .snapshot(self.status(), self.step_counter.load(Ordering::SeqCst))
    }
}

/// 运行结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// 二进制结果
    pub payload: Vec<u8>,
    pub snapshot: ProgressSnapshot,
}

/// 本次运行拉取的资源
#[derive(Default)]
struct Fetched {
    /// 资源名 -> 缓存路径，写入运行变量 `resources`
    vars: Map<String, Value>,
    /// 持有的缓存文件，运行结束时归还
    files: Vec<PathBuf>,
}

/// walk 的结束方式
enum Finish {
    Completed(usize, usize),
    Timeout,
    Cancelled,
}

/// 运行编排器
pub struct RunOrchestrator {
    run_id: String,
    definition: RunDefinition,
    registry: Arc<AdapterRegistry>,
    options: RunOptions,
    throttle: ThrottlePolicy,
    sandbox: Arc<dyn ScriptSandbox>,
    env: Variables,
    events: Option<async_channel::Sender<RunEvent>>,
    file_cache: Option<Arc<FileCache>>,
    control: RunControl,
}

impl RunOrchestrator {
    pub fn new(definition: RunDefinition, registry: Arc<AdapterRegistry>) -> Self {
        let options = RunOptions::default();
        let throttle = ThrottlePolicy::default();
        let tree = Arc::new(ResultTree::new(throttle.clone(), options.record_detail));
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            definition,
            registry,
            options,
            throttle,
            sandbox: Arc::new(ExpressionSandbox::new()),
            env: Variables::new(),
            events: None,
            file_cache: None,
            control: RunControl::new(tree),
        }
    }

    fn rebuild_tree(&mut self) {
        self.control.tree = Arc::new(ResultTree::new(
            self.throttle.clone(),
            self.options.record_detail,
        ));
    }

    /// 设置运行选项（需在 [`control`](Self::control) 之前调用）
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self.rebuild_tree();
        self
    }

    /// 设置进度节流策略（需在 [`control`](Self::control) 之前调用）
    pub fn with_throttle(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle = policy;
        self.rebuild_tree();
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// 环境级变量（批次共享）
    pub fn with_env(mut self, env: Variables) -> Self {
        self.env = env;
        self
    }

    pub fn with_events(mut self, events: async_channel::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_file_cache(mut self, cache: Arc<FileCache>) -> Self {
        self.file_cache = Some(cache);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    fn build_context(&self, options: RunOptions) -> RunContext {
        let mut ctx = RunContext::new(&self.run_id, options, Arc::clone(&self.registry))
            .with_variables(
                Variables::from_map(self.definition.variables.clone()),
                self.env.clone(),
            )
            .with_tree(Arc::clone(&self.control.tree))
            .with_sandbox(Arc::clone(&self.sandbox))
            .with_cancel(self.control.cancel.clone())
            .with_interact(Arc::clone(&self.control.interact))
            .with_step_counter(Arc::clone(&self.control.step_counter));
        if let Some(events) = &self.events {
            ctx = ctx.with_events(events.clone());
        }
        if let Some(cache) = &self.file_cache {
            ctx = ctx.with_file_cache(Arc::clone(cache));
        }
        ctx
    }

    fn emit_progress(&self, ctx: &RunContext, status: RunStatus) {
        let snapshot = ctx.tree().snapshot(status, ctx.steps_started());
        ctx.emit(RunEvent::Message(RunMessage::Progress(snapshot)));
    }

    /// 执行运行，总是返回一份结果
    pub async fn run(self) -> RunOutcome {
        let started_ms = now_ms();
        let mut options = self.options.clone();
        if let Some(timeout_ms) = self.definition.timeout_ms {
            options.timeout_ms = timeout_ms;
        }
        let timeout = options.timeout();
        let ctx = self.build_context(options);
        let mut errors = Vec::new();
        let mut fetched = Fetched::default();

        if self.control.is_cancelled() {
            info!("运行 {} 在开始前已被取消", self.run_id);
            self.control.set_status(RunStatus::Cancel);
            return self.finish(&ctx, RunStatus::Cancel, errors, started_ms);
        }

        info!("开始运行 {} ({})", self.run_id, self.definition.name);
        self.control.set_status(RunStatus::Running);

        if let Err(message) = self.prepare(&ctx, &mut fetched).await {
            error!("运行 {} 准备失败: {}", self.run_id, message);
            errors.push(message);
            self.control.set_status(RunStatus::Error);
            ctx.close_resources();
            self.release_cache(&fetched).await;
            return self.finish(&ctx, RunStatus::Error, errors, started_ms);
        }

        self.install_progress_listener();
        self.emit_progress(&ctx, RunStatus::Running);

        let finish = {
            let scope = ctx.root_scope();
            let walk = run_sequence(&ctx, &self.definition.steps, None, None, &scope);
            tokio::pin!(walk);

            let finish = tokio::select! {
                result = &mut walk => match result {
                    Ok(_) if self.control.is_cancelled() => Finish::Cancelled,
                    Ok(failures) => Finish::Completed(failures.len(), self.definition.steps.len()),
                    Err(_) => Finish::Cancelled,
                },
                _ = tokio::time::sleep(timeout) => Finish::Timeout,
                _ = self.control.cancel.cancelled() => Finish::Cancelled,
            };

            if !matches!(finish, Finish::Completed(..)) {
                ctx.tree().stop();
                ctx.cancel_token().cancel();
                // 给正在执行的步骤一次机会写入终止状态
                if poll_immediate(&mut walk).await.is_none() {
                    debug!("运行 {} 的步骤未能在一次调度内退出", self.run_id);
                }
            }
            finish
        };

        let status = match finish {
            Finish::Completed(failed, _) if failed > 0 => RunStatus::Error,
            Finish::Completed(_, total) if total > 0 && self.all_top_level_skipped() => {
                RunStatus::Skip
            }
            Finish::Completed(..) => RunStatus::Done,
            Finish::Timeout => {
                warn!("运行 {} 超时 ({}ms)", self.run_id, timeout.as_millis());
                let message = format!("运行超时 ({}ms)", timeout.as_millis());
                ctx.tree().finalize_interrupted(&message, "timeout");
                errors.push(message);
                RunStatus::Timeout
            }
            Finish::Cancelled => {
                warn!("运行 {} 被取消", self.run_id);
                ctx.tree()
                    .finalize_interrupted("运行已取消", StepError::Cancelled.kind());
                errors.push("运行已取消".to_string());
                RunStatus::Cancel
            }
        };
        self.control.set_status(status);

        let closed = ctx.close_resources();
        let cleared = self.release_cache(&fetched).await;
        debug!("运行 {} 清理: 关闭 {} 个资源, 删除 {} 个缓存文件", self.run_id, closed, cleared);

        self.finish(&ctx, status, errors, started_ms)
    }

    fn all_top_level_skipped(&self) -> bool {
        (0..self.definition.steps.len()).all(|i| {
            self.control
                .tree
                .get_by_id(&i.to_string())
                .map(|node| node.status == StepStatus::Skip)
                .unwrap_or(false)
        })
    }

    async fn release_cache(&self, fetched: &Fetched) -> usize {
        match &self.file_cache {
            Some(cache) if !fetched.files.is_empty() => cache.release(&fetched.files).await,
            _ => 0,
        }
    }

    fn install_progress_listener(&self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        let status = Arc::clone(&self.control.status);
        let steps = Arc::clone(&self.control.step_counter);
        self.control.tree.on_update(move |counters| {
            let snapshot = ProgressSnapshot {
                status: *status.lock().unwrap_or_else(PoisonError::into_inner),
                progress: counters.progress(),
                counters: *counters,
                steps_started: steps.load(Ordering::SeqCst),
            };
            let _ = events.try_send(RunEvent::Message(RunMessage::Progress(snapshot)));
        });
    }

    /// 准备阶段：适配器 `prepare`、预置节点、拉取资源
    async fn prepare(&self, ctx: &RunContext, fetched: &mut Fetched) -> Result<(), String> {
        for (index, step) in self.definition.steps.iter().enumerate() {
            prepare_step(ctx, step, ExtraConfig::root(index), true, fetched).await?;
        }
        if !fetched.vars.is_empty() {
            ctx.variables()
                .set_run("resources", Value::Object(fetched.vars.clone()));
        }
        Ok(())
    }

    fn finish(
        &self,
        ctx: &RunContext,
        status: RunStatus,
        errors: Vec<String>,
        started_ms: u64,
    ) -> RunOutcome {
        let tree = ctx.tree();
        tree.flush();
        let snapshot = tree.snapshot(status, ctx.steps_started());
        ctx.emit(RunEvent::Message(RunMessage::Progress(snapshot.clone())));

        let ended_ms = now_ms();
        let index = IndexTree {
            run_id: self.run_id.clone(),
            name: self.definition.name.clone(),
            status,
            errors,
            dataset: ctx.dataset(),
            steps: tree.index_nodes(),
        };
        let details = tree.details();
        let parts = RunResultParts {
            engine_version: ctx.options().engine_version,
            status,
            progress: snapshot.progress,
            started_ms,
            ended_ms,
            options: ctx.options().option_bits(),
            index: &index,
            details: &details,
            slots: ctx.steps_started(),
        };

        let payload = match encode_run_result(&parts) {
            Ok(payload) => payload,
            Err(e) => {
                error!("运行 {} 结果序列化失败: {}", self.run_id, e);
                minimal_error_payload(
                    ctx.options().engine_version,
                    &self.run_id,
                    started_ms,
                    ended_ms,
                    &format!("结果序列化失败: {}", e),
                )
            }
        };

        info!(
            "运行 {} 结束: {} (进度 {:.0}%, {} 字节)",
            self.run_id,
            status,
            snapshot.progress * 100.0,
            payload.len()
        );

        RunOutcome {
            run_id: self.run_id.clone(),
            status,
            payload,
            snapshot,
        }
    }
}

/// 递归准备一个步骤
///
/// `seed` 为真时预置 WAIT 节点；动态组合的子步骤只做适配器准备和资源拉取。
fn prepare_step<'a>(
    ctx: &'a RunContext,
    definition: &'a StepDefinition,
    extra: ExtraConfig,
    seed: bool,
    fetched: &'a mut Fetched,
) -> BoxFuture<'a, Result<(), String>> {
    async move {
        let mut base = NodeBase::for_step(definition, &extra, StepStatus::Wait);

        if definition.combination().is_none() && !definition.disabled {
            // 未注册的类型留到执行时记为系统错误
            if let Ok(builder) = ctx.registry().get(&definition.step_type).await {
                builder
                    .prepare(definition, ctx)
                    .await
                    .map_err(|e| format!("步骤 {} 准备失败: {}", extra.id, e))?;
                base = base.with_extra(builder.create_init_result(definition));
            }
        }

        for resource in &definition.resources {
            if fetched.vars.contains_key(&resource.name) {
                continue;
            }
            let cache = ctx
                .file_cache()
                .ok_or_else(|| format!("步骤 {} 声明了资源但未配置文件缓存", extra.id))?;
            let path = cache
                .fetch(resource)
                .await
                .map_err(|e| format!("步骤 {} 资源拉取失败: {}", extra.id, e))?;
            fetched.vars.insert(
                resource.name.clone(),
                json!(path.to_string_lossy().into_owned()),
            );
            fetched.files.push(path);
        }

        if seed {
            ctx.tree().record_base(base);
        }

        let dynamic = definition
            .combination()
            .map(|kind| kind.is_dynamic())
            .unwrap_or(false);
        if dynamic {
            for (index, child) in definition.children().iter().enumerate() {
                prepare_step(ctx, child, extra.child(index), false, fetched).await?;
            }
        } else {
            for (child_extra, child) in static_children(definition, &extra) {
                prepare_step(ctx, child, child_extra, seed, fetched).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;

    fn definition(steps: Vec<StepDefinition>) -> RunDefinition {
        RunDefinition {
            name: "unit".to_string(),
            timeout_ms: None,
            variables: Map::new(),
            steps,
        }
    }

    #[tokio::test]
    async fn test_prepare_seeds_wait_nodes() {
        let def = definition(vec![
            StepDefinition::new("echo").with_config(json!({"status": 201})),
            StepDefinition::new("group").with_steps(vec![StepDefinition::new("echo")]),
            StepDefinition::new("loop").with_steps(vec![StepDefinition::new("echo")]),
        ]);
        let orchestrator = RunOrchestrator::new(def, Arc::new(AdapterRegistry::with_builtins()));
        let ctx = orchestrator.build_context(RunOptions::default());

        orchestrator
            .prepare(&ctx, &mut Fetched::default())
            .await
            .unwrap();

        let tree = ctx.tree();
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.get_by_id("0").unwrap().extra, Some(json!({"status": 201})));
        assert_eq!(tree.get_by_id("1.0").unwrap().status, StepStatus::Wait);
        assert!(tree.get_by_id("2.0").is_none());
        assert_eq!(tree.counters().wait, 4);
    }

    #[tokio::test]
    async fn test_resources_without_cache_fail_prepare() {
        let mut step = StepDefinition::new("echo");
        step.resources.push(crate::definition::ResourceRef {
            source: "/tmp/none".to_string(),
            name: "none".to_string(),
        });
        let orchestrator = RunOrchestrator::new(
            definition(vec![step]),
            Arc::new(AdapterRegistry::with_builtins()),
        );
        let outcome = orchestrator.run().await;
        assert_eq!(outcome.status, RunStatus::Error);
    }
}
