//! 运行上下文
//!
//! 一次运行的全部共享状态，由编排器持有，控制器以 `&RunContext` 借用。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atp_common::{InteractAsk, RunMessage};

use crate::file_cache::FileCache;
use crate::registry::AdapterRegistry;
use crate::result_tree::ResultTree;
use crate::sandbox::{ExpressionSandbox, ScriptSandbox};
use crate::throttle::ThrottlePolicy;
use crate::variables::{SharedVariables, VariableScope, Variables};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 选项位：忽略步骤错误
pub const OPTION_IGNORE_ERRORS: u32 = 0x1;
/// 选项位：不记录详情
pub const OPTION_NO_DETAIL: u32 = 0x2;

/// 运行选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// 全局超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// 步骤出错后是否继续执行后续步骤
    #[serde(default)]
    pub ignore_errors: bool,

    /// 是否记录步骤详情
    #[serde(default = "default_record_detail")]
    pub record_detail: bool,

    /// 异步组合步骤每批并发数
    #[serde(default = "default_async_batch_size")]
    pub async_batch_size: usize,

    /// 写入结果头的引擎版本
    #[serde(default = "default_engine_version")]
    pub engine_version: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            ignore_errors: false,
            record_detail: default_record_detail(),
            async_batch_size: default_async_batch_size(),
            engine_version: default_engine_version(),
        }
    }
}

impl RunOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 应用批次选项位
    pub fn with_option_bits(mut self, bits: u32) -> Self {
        self.ignore_errors = bits & OPTION_IGNORE_ERRORS != 0;
        self.record_detail = bits & OPTION_NO_DETAIL == 0;
        self
    }

    /// 编码为选项位
    pub fn option_bits(&self) -> u32 {
        let mut bits = 0;
        if self.ignore_errors {
            bits |= OPTION_IGNORE_ERRORS;
        }
        if !self.record_detail {
            bits |= OPTION_NO_DETAIL;
        }
        bits
    }
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_record_detail() -> bool {
    true
}

fn default_async_batch_size() -> usize {
    4
}

fn default_engine_version() -> u32 {
    1
}

/// 步骤位置信息（每个步骤新建一份）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraConfig {
    /// 步骤 ID
    pub id: String,
    /// 父步骤 ID
    pub parent: Option<String>,
    /// 分组下标（迭代或分支）
    pub group: Option<usize>,
    /// 兄弟节点中的下标
    pub index: usize,
    /// 嵌套深度（顶层为 0）
    pub depth: usize,
}

impl ExtraConfig {
    /// 顶层步骤：`"{index}"`
    pub fn root(index: usize) -> Self {
        Self {
            id: index.to_string(),
            parent: None,
            group: None,
            index,
            depth: 0,
        }
    }

    /// 静态子步骤：`"{parent}.{index}"`
    pub fn child(&self, index: usize) -> Self {
        Self {
            id: format!("{}.{}", self.id, index),
            parent: Some(self.id.clone()),
            group: None,
            index,
            depth: self.depth + 1,
        }
    }

    /// 分组子步骤：`"{parent}.{group}:{index}"`
    pub fn grouped_child(&self, group: usize, index: usize) -> Self {
        Self {
            id: format!("{}.{}:{}", self.id, group, index),
            parent: Some(self.id.clone()),
            group: Some(group),
            index,
            depth: self.depth + 1,
        }
    }
}

/// 数据驱动统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DatasetCounters {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 运行向外发出的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// 透传消息（进度、步骤状态、错误）
    Message(RunMessage),
    /// 全局变量更新
    SetGlobalVariable { name: String, value: Value },
    /// 交互询问
    InteractAsk(InteractAsk),
}

/// 交互应答路由（按全局步骤序号）
#[derive(Debug, Default)]
pub struct InteractBus {
    waiters: Mutex<HashMap<usize, oneshot::Sender<Vec<String>>>>,
}

impl InteractBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一次性监听
    pub fn listen(&self, step_index: usize) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        if lock(&self.waiters).insert(step_index, tx).is_some() {
            warn!("步骤 #{} 的交互监听被覆盖", step_index);
        }
        rx
    }

    /// 投递应答，没有对应监听时返回 false
    pub fn answer(&self, step_index: usize, answers: Vec<String>) -> bool {
        match lock(&self.waiters).remove(&step_index) {
            Some(tx) => tx.send(answers).is_ok(),
            None => {
                debug!("步骤 #{} 没有等待中的交互", step_index);
                false
            }
        }
    }

    /// 等待应答的步骤序号
    pub fn pending(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = lock(&self.waiters).keys().copied().collect();
        pending.sort_unstable();
        pending
    }
}

struct HeldResource {
    name: String,
    close: Box<dyn FnOnce() + Send>,
}

/// 运行上下文
pub struct RunContext {
    run_id: String,
    options: RunOptions,
    variables: Arc<SharedVariables>,
    cookies: Mutex<HashMap<String, String>>,
    interact: Arc<InteractBus>,
    step_counter: Arc<AtomicUsize>,
    dataset: Mutex<DatasetCounters>,
    cancel: CancellationToken,
    tree: Arc<ResultTree>,
    registry: Arc<AdapterRegistry>,
    sandbox: Arc<dyn ScriptSandbox>,
    events: Option<async_channel::Sender<RunEvent>>,
    resources: Mutex<Vec<HeldResource>>,
    file_cache: Option<Arc<FileCache>>,
}

impl RunContext {
    /// 使用默认沙箱和不节流的结果树创建上下文
    pub fn new(run_id: &str, options: RunOptions, registry: Arc<AdapterRegistry>) -> Self {
        let tree = Arc::new(ResultTree::new(
            ThrottlePolicy::unthrottled(),
            options.record_detail,
        ));
        Self {
            run_id: run_id.to_string(),
            options,
            variables: Arc::new(SharedVariables::default()),
            cookies: Mutex::new(HashMap::new()),
            interact: Arc::new(InteractBus::new()),
            step_counter: Arc::new(AtomicUsize::new(0)),
            dataset: Mutex::new(DatasetCounters::default()),
            cancel: CancellationToken::new(),
            tree,
            registry,
            sandbox: Arc::new(ExpressionSandbox::new()),
            events: None,
            resources: Mutex::new(Vec::new()),
            file_cache: None,
        }
    }

    pub fn with_variables(mut self, run: Variables, env: Variables) -> Self {
        self.variables = Arc::new(SharedVariables::new(run, env));
        self
    }

    pub fn with_tree(mut self, tree: Arc<ResultTree>) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_events(mut self, events: async_channel::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_interact(mut self, interact: Arc<InteractBus>) -> Self {
        self.interact = interact;
        self
    }

    pub fn with_step_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.step_counter = counter;
        self
    }

    pub fn with_file_cache(mut self, cache: Arc<FileCache>) -> Self {
        self.file_cache = Some(cache);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn variables(&self) -> &Arc<SharedVariables> {
        &self.variables
    }

    /// 根作用域（无局部变量）
    pub fn root_scope(&self) -> VariableScope {
        VariableScope::new(Arc::clone(&self.variables))
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        lock(&self.cookies).get(name).cloned()
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        lock(&self.cookies).insert(name.to_string(), value.to_string());
    }

    pub fn interact(&self) -> &Arc<InteractBus> {
        &self.interact
    }

    /// 分配下一个全局步骤序号
    pub fn next_step_index(&self) -> usize {
        self.step_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// 已分配的步骤序号数
    pub fn steps_started(&self) -> usize {
        self.step_counter.load(Ordering::SeqCst)
    }

    /// 更新数据驱动统计
    pub fn update_dataset<F: FnOnce(&mut DatasetCounters)>(&self, update: F) {
        update(&mut lock(&self.dataset));
    }

    pub fn dataset(&self) -> DatasetCounters {
        *lock(&self.dataset)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn tree(&self) -> &Arc<ResultTree> {
        &self.tree
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<dyn ScriptSandbox> {
        &self.sandbox
    }

    pub fn file_cache(&self) -> Option<&Arc<FileCache>> {
        self.file_cache.as_ref()
    }

    /// 发出事件；通道已关闭时静默丢弃
    pub fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                debug!("运行 {} 的事件通道已关闭", self.run_id);
            }
        }
    }

    /// 登记运行结束时需要关闭的资源
    pub fn hold<F>(&self, name: &str, close: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.resources).push(HeldResource {
            name: name.to_string(),
            close: Box::new(close),
        });
    }

    /// 按登记的逆序关闭所有资源，返回关闭数量
    pub fn close_resources(&self) -> usize {
        let held: Vec<HeldResource> = lock(&self.resources).drain(..).collect();
        let count = held.len();
        for resource in held.into_iter().rev() {
            debug!("关闭资源: {}", resource.name);
            (resource.close)();
        }
        count
    }
}
