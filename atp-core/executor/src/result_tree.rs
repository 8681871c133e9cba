//! 结果树管理
//!
//! 运行期间增量构建的结果节点树。节点按步骤 ID 索引，
//! 详情数据按全局步骤序号单独存放。各状态计数器与状态变更
//! 在同一把锁内更新，计数器之和始终等于节点数。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use atp_common::{ProgressSnapshot, RunStatus, StatusCounters, StepStatus};

use crate::context::{DatasetCounters, ExtraConfig};
use crate::definition::StepDefinition;
use crate::throttle::{Throttle, ThrottlePolicy};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// 步骤被禁用
    Disabled,
    /// 条件分支未命中
    Condition,
    /// 数据行标记跳过
    DatasetRow,
}

/// 子节点布局（与定义的形状一致）
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NodeSteps {
    #[default]
    None,
    Flat(Vec<String>),
    Groups(Vec<Vec<String>>),
}

/// 结果节点
#[derive(Debug, Clone, PartialEq)]
pub struct ResultNode {
    pub id: String,
    pub parent: Option<String>,
    pub group: Option<usize>,
    pub step_type: String,
    pub name: Option<String>,
    pub status: StepStatus,
    pub errors: Vec<String>,
    pub error_kind: Option<String>,
    pub elapsed_ms: u64,
    pub bypassed: bool,
    pub skip_reason: Option<SkipReason>,
    pub step_index: Option<usize>,
    pub extra: Option<Value>,
    pub response_error: Option<String>,
    pub steps: NodeSteps,
}

/// 节点基础信息写入
#[derive(Debug, Clone)]
pub struct NodeBase {
    pub id: String,
    pub parent: Option<String>,
    pub group: Option<usize>,
    pub step_type: String,
    pub name: Option<String>,
    pub status: StepStatus,
    pub bypassed: bool,
    pub skip_reason: Option<SkipReason>,
    pub step_index: Option<usize>,
    pub extra: Option<Value>,
    pub grouped_children: bool,
}

impl NodeBase {
    /// 由步骤定义和位置信息生成
    pub fn for_step(definition: &StepDefinition, extra: &ExtraConfig, status: StepStatus) -> Self {
        Self {
            id: extra.id.clone(),
            parent: extra.parent.clone(),
            group: extra.group,
            step_type: definition.step_type.clone(),
            name: definition.name.clone(),
            status,
            bypassed: false,
            skip_reason: None,
            step_index: None,
            extra: None,
            grouped_children: definition
                .combination()
                .map(|kind| kind.is_grouped())
                .unwrap_or(false),
        }
    }

    pub fn bypassed(mut self) -> Self {
        self.status = StepStatus::Wait;
        self.bypassed = true;
        self
    }

    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.status = StepStatus::Skip;
        self.skip_reason = Some(reason);
        self
    }

    pub fn with_step_index(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn with_extra(mut self, extra: Option<Value>) -> Self {
        self.extra = extra;
        self
    }
}

/// 步骤结果写入
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub status: StepStatus,
    pub errors: Vec<String>,
    pub error_kind: Option<String>,
    pub elapsed_ms: u64,
    pub extra: Option<Value>,
    pub response_error: Option<String>,
    pub detail: Option<Value>,
}

/// 可序列化的嵌套节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexNode {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub bypassed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_error: Option<String>,
    #[serde(default, skip_serializing_if = "IndexChildren::is_none")]
    pub steps: IndexChildren,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexChildren {
    #[default]
    None,
    Flat(Vec<IndexNode>),
    Groups(Vec<Vec<IndexNode>>),
}

impl IndexChildren {
    pub fn is_none(&self) -> bool {
        matches!(self, IndexChildren::None)
    }
}

/// 运行结果索引（编码进结果头之后的索引块）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTree {
    pub run_id: String,
    #[serde(default)]
    pub name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub dataset: DatasetCounters,
    #[serde(default)]
    pub steps: Vec<IndexNode>,
}

impl IndexTree {
    /// 按 ID 深度优先查找节点
    pub fn find(&self, id: &str) -> Option<&IndexNode> {
        fn walk<'a>(nodes: &'a [IndexNode], id: &str) -> Option<&'a IndexNode> {
            for node in nodes {
                if node.id == id {
                    return Some(node);
                }
                let found = match &node.steps {
                    IndexChildren::None => None,
                    IndexChildren::Flat(children) => walk(children, id),
                    IndexChildren::Groups(groups) => groups.iter().find_map(|g| walk(g, id)),
                };
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        walk(&self.steps, id)
    }
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<String, ResultNode>,
    roots: Vec<String>,
    details: BTreeMap<usize, Value>,
    counters: StatusCounters,
    stopped: bool,
}

impl TreeState {
    fn attach(&mut self, parent: Option<&str>, group: Option<usize>, id: &str) {
        let Some(parent_id) = parent else {
            self.roots.push(id.to_string());
            return;
        };
        let Some(parent) = self.nodes.get_mut(parent_id) else {
            warn!("父节点 {} 不存在，节点 {} 未挂载", parent_id, id);
            return;
        };

        match (group, &mut parent.steps) {
            (None, NodeSteps::None) => parent.steps = NodeSteps::Flat(vec![id.to_string()]),
            (None, NodeSteps::Flat(ids)) => ids.push(id.to_string()),
            (Some(g), NodeSteps::None) => {
                let mut groups = vec![Vec::new(); g + 1];
                groups[g].push(id.to_string());
                parent.steps = NodeSteps::Groups(groups);
            }
            (Some(g), NodeSteps::Groups(groups)) => {
                if groups.len() <= g {
                    groups.resize_with(g + 1, Vec::new);
                }
                groups[g].push(id.to_string());
            }
            _ => warn!("节点 {} 的分组形状与父节点 {} 不一致", id, parent_id),
        }
    }

    fn set_status(&mut self, id: &str, status: StepStatus) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        let old = node.status;
        node.status = status;
        self.counters.transition(old, status);
        true
    }

    fn build(&self, id: &str) -> Option<IndexNode> {
        let node = self.nodes.get(id)?;
        let steps = match &node.steps {
            NodeSteps::None => IndexChildren::None,
            NodeSteps::Flat(ids) => {
                IndexChildren::Flat(ids.iter().filter_map(|c| self.build(c)).collect())
            }
            NodeSteps::Groups(groups) => IndexChildren::Groups(
                groups
                    .iter()
                    .map(|g| g.iter().filter_map(|c| self.build(c)).collect())
                    .collect(),
            ),
        };
        Some(IndexNode {
            id: node.id.clone(),
            step_type: node.step_type.clone(),
            name: node.name.clone(),
            status: node.status,
            errors: node.errors.clone(),
            error_kind: node.error_kind.clone(),
            elapsed_ms: node.elapsed_ms,
            bypassed: node.bypassed,
            skip_reason: node.skip_reason,
            step_index: node.step_index,
            extra: node.extra.clone(),
            response_error: node.response_error.clone(),
            steps,
        })
    }
}

type UpdateListener = Box<dyn Fn(&StatusCounters) + Send + Sync>;

/// 结果树
pub struct ResultTree {
    state: Mutex<TreeState>,
    listeners: Mutex<Vec<UpdateListener>>,
    throttle: Mutex<Throttle>,
    record_detail: bool,
}

impl ResultTree {
    pub fn new(policy: ThrottlePolicy, record_detail: bool) -> Self {
        Self {
            state: Mutex::new(TreeState::default()),
            listeners: Mutex::new(Vec::new()),
            throttle: Mutex::new(Throttle::new(policy)),
            record_detail,
        }
    }

    /// 写入节点基础信息；节点不存在时创建并挂载到父节点
    pub fn record_base(&self, base: NodeBase) -> bool {
        {
            let mut state = lock(&self.state);
            if state.stopped {
                debug!("结果树已停止，忽略节点 {} 的写入", base.id);
                return false;
            }

            if let Some(node) = state.nodes.get_mut(&base.id) {
                let old = node.status;
                node.status = base.status;
                node.bypassed = base.bypassed;
                node.skip_reason = base.skip_reason;
                if base.step_index.is_some() {
                    node.step_index = base.step_index;
                }
                if base.extra.is_some() {
                    node.extra = base.extra;
                }
                state.counters.transition(old, base.status);
            } else {
                let node = ResultNode {
                    id: base.id.clone(),
                    parent: base.parent.clone(),
                    group: base.group,
                    step_type: base.step_type,
                    name: base.name,
                    status: base.status,
                    errors: Vec::new(),
                    error_kind: None,
                    elapsed_ms: 0,
                    bypassed: base.bypassed,
                    skip_reason: base.skip_reason,
                    step_index: base.step_index,
                    extra: base.extra,
                    response_error: None,
                    steps: if base.grouped_children {
                        NodeSteps::Groups(Vec::new())
                    } else {
                        NodeSteps::None
                    },
                };
                state.counters.add(node.status);
                state.nodes.insert(base.id.clone(), node);
                state.attach(base.parent.as_deref(), base.group, &base.id);
            }
        }
        self.notify(false);
        true
    }

    /// 仅更新状态（例如进入 INTERACT）
    pub fn set_status(&self, id: &str, status: StepStatus) -> bool {
        let applied = {
            let mut state = lock(&self.state);
            !state.stopped && state.set_status(id, status)
        };
        if applied {
            self.notify(false);
        }
        applied
    }

    /// 写入步骤结果
    ///
    /// 结果树停止后，只允许已进入 RUNNING/INTERACT 的节点写入终止状态，详情被丢弃。
    pub fn record_result(&self, id: &str, result: StepResult) -> bool {
        {
            let mut state = lock(&self.state);
            let stopped = state.stopped;
            let Some(node) = state.nodes.get_mut(id) else {
                warn!("结果节点 {} 不存在", id);
                return false;
            };
            if stopped
                && !(matches!(node.status, StepStatus::Running | StepStatus::Interact)
                    && result.status.is_terminal())
            {
                return false;
            }

            let old = node.status;
            node.status = result.status;
            node.errors = result.errors;
            node.error_kind = result.error_kind;
            node.elapsed_ms = result.elapsed_ms;
            node.response_error = result.response_error;
            if result.extra.is_some() {
                node.extra = result.extra;
            }
            let step_index = node.step_index;
            state.counters.transition(old, result.status);

            if let (Some(detail), Some(index), false) = (result.detail, step_index, stopped) {
                if self.record_detail {
                    state.details.insert(index, detail);
                }
            }
        }
        self.notify(false);
        true
    }

    /// 按 ID 读取节点
    pub fn get_by_id(&self, id: &str) -> Option<ResultNode> {
        lock(&self.state).nodes.get(id).cloned()
    }

    /// 按全局步骤序号读取详情
    pub fn get_detail(&self, step_index: usize) -> Option<Value> {
        lock(&self.state).details.get(&step_index).cloned()
    }

    /// 全部详情
    pub fn details(&self) -> BTreeMap<usize, Value> {
        lock(&self.state).details.clone()
    }

    /// 注册更新监听器（按节流策略调用）
    pub fn on_update<F>(&self, listener: F)
    where
        F: Fn(&StatusCounters) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Box::new(listener));
    }

    /// 立即通知所有监听器
    pub fn flush(&self) {
        self.notify(true);
    }

    fn notify(&self, force: bool) {
        let (counters, total) = {
            let state = lock(&self.state);
            (state.counters, state.nodes.len())
        };
        {
            let mut throttle = lock(&self.throttle);
            if force {
                throttle.force();
            } else if !throttle.should_emit(total) {
                return;
            }
        }
        for listener in lock(&self.listeners).iter() {
            listener(&counters);
        }
    }

    /// 停止写入
    pub fn stop(&self) {
        lock(&self.state).stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// 将仍处于 RUNNING/INTERACT 的节点置为 ERROR，返回受影响的节点数
    pub fn finalize_interrupted(&self, message: &str, kind: &str) -> usize {
        let mut state = lock(&self.state);
        let interrupted: Vec<String> = state
            .nodes
            .values()
            .filter(|n| matches!(n.status, StepStatus::Running | StepStatus::Interact))
            .map(|n| n.id.clone())
            .collect();

        for id in &interrupted {
            state.set_status(id, StepStatus::Error);
            if let Some(node) = state.nodes.get_mut(id) {
                node.errors.push(message.to_string());
                node.error_kind = Some(kind.to_string());
            }
        }
        interrupted.len()
    }

    pub fn counters(&self) -> StatusCounters {
        lock(&self.state).counters
    }

    pub fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }

    /// 进度快照
    pub fn snapshot(&self, status: RunStatus, steps_started: usize) -> ProgressSnapshot {
        let counters = self.counters();
        ProgressSnapshot {
            status,
            progress: counters.progress(),
            counters,
            steps_started,
        }
    }

    /// 嵌套的顶层节点列表
    pub fn index_nodes(&self) -> Vec<IndexNode> {
        let state = lock(&self.state);
        state.roots.iter().filter_map(|id| state.build(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn base(id: &str, parent: Option<&str>, group: Option<usize>) -> NodeBase {
        NodeBase {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            group,
            step_type: "echo".to_string(),
            name: None,
            status: StepStatus::Wait,
            bypassed: false,
            skip_reason: None,
            step_index: None,
            extra: None,
            grouped_children: false,
        }
    }

    fn assert_invariant(tree: &ResultTree) {
        assert_eq!(tree.counters().total(), tree.node_count());
    }

    #[test]
    fn test_counters_match_node_count() {
        let tree = ResultTree::new(ThrottlePolicy::unthrottled(), true);
        tree.record_base(base("0", None, None));
        assert_invariant(&tree);
        tree.record_base(base("0.0", Some("0"), None));
        tree.record_base(base("0.1", Some("0"), None));
        assert_invariant(&tree);

        tree.record_base(NodeBase { status: StepStatus::Running, ..base("0", None, None) });
        tree.set_status("0", StepStatus::Interact);
        assert_invariant(&tree);

        tree.record_result("0", StepResult { status: StepStatus::Done, ..Default::default() });
        tree.record_base(base("0.1", Some("0"), None).skipped(SkipReason::Condition));
        assert_invariant(&tree);

        let counters = tree.counters();
        assert_eq!(counters.done, 1);
        assert_eq!(counters.skip, 1);
        assert_eq!(counters.wait, 1);
    }

    #[test]
    fn test_dynamic_group_slots() {
        let tree = ResultTree::new(ThrottlePolicy::unthrottled(), true);
        tree.record_base(NodeBase { grouped_children: true, ..base("0", None, None) });
        tree.record_base(base("0.2:0", Some("0"), Some(2)));
        tree.record_base(base("0.0:0", Some("0"), Some(0)));
        tree.record_base(base("0.0:1", Some("0"), Some(0)));

        let root = tree.get_by_id("0").unwrap();
        match root.steps {
            NodeSteps::Groups(groups) => {
                assert_eq!(groups.len(), 3);
                assert_eq!(groups[0], vec!["0.0:0".to_string(), "0.0:1".to_string()]);
                assert!(groups[1].is_empty());
                assert_eq!(groups[2], vec!["0.2:0".to_string()]);
            }
            other => panic!("unexpected layout: {:?}", other),
        }

        let index = tree.index_nodes();
        assert!(matches!(&index[0].steps, IndexChildren::Groups(g) if g.len() == 3));
    }

    #[test]
    fn test_detail_keyed_by_step_index() {
        let tree = ResultTree::new(ThrottlePolicy::unthrottled(), true);
        tree.record_base(base("0", None, None).with_step_index(4));
        tree.record_result(
            "0",
            StepResult {
                status: StepStatus::Done,
                detail: Some(json!({"response": 1})),
                ..Default::default()
            },
        );
        assert_eq!(tree.get_detail(4), Some(json!({"response": 1})));
        assert!(tree.get_detail(0).is_none());

        let no_detail = ResultTree::new(ThrottlePolicy::unthrottled(), false);
        no_detail.record_base(base("0", None, None).with_step_index(0));
        no_detail.record_result(
            "0",
            StepResult { status: StepStatus::Done, detail: Some(json!(1)), ..Default::default() },
        );
        assert!(no_detail.get_detail(0).is_none());
    }

    #[test]
    fn test_stop_suppresses_writes() {
        let tree = ResultTree::new(ThrottlePolicy::unthrottled(), true);
        tree.record_base(base("0", None, None));
        tree.record_base(NodeBase { status: StepStatus::Running, ..base("1", None, None) }.with_step_index(0));
        tree.stop();

        assert!(!tree.record_base(base("2", None, None)));
        assert!(!tree.set_status("0", StepStatus::Running));
        assert!(!tree.record_result("0", StepResult { status: StepStatus::Done, ..Default::default() }));
        assert!(tree.record_result(
            "1",
            StepResult { status: StepStatus::Done, detail: Some(json!(1)), ..Default::default() }
        ));

        assert_eq!(tree.get_by_id("0").unwrap().status, StepStatus::Wait);
        assert_eq!(tree.get_by_id("1").unwrap().status, StepStatus::Done);
        assert!(tree.get_detail(0).is_none());
        assert!(tree.get_by_id("2").is_none());
        assert_invariant(&tree);
    }

    #[test]
    fn test_finalize_interrupted() {
        let tree = ResultTree::new(ThrottlePolicy::unthrottled(), true);
        tree.record_base(NodeBase { status: StepStatus::Running, ..base("0", None, None) });
        tree.record_base(base("1", None, None));
        tree.stop();

        assert_eq!(tree.finalize_interrupted("已超时", "timeout"), 1);
        let node = tree.get_by_id("0").unwrap();
        assert_eq!(node.status, StepStatus::Error);
        assert_eq!(node.error_kind.as_deref(), Some("timeout"));
        assert_eq!(tree.get_by_id("1").unwrap().status, StepStatus::Wait);
        assert_invariant(&tree);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_listener_throttled() {
        let tree = ResultTree::new(ThrottlePolicy::default(), true);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tree.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..10 {
            tree.record_base(base(&i.to_string(), None, None));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        tree.record_base(base("10", None, None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tree.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
