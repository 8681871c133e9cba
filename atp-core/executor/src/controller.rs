//! 步骤控制器状态机
//!
//! `WAIT → RUNNING → DONE | ERROR | INTERACT → DONE | ERROR`。
//! 禁用步骤直接记为 SKIP，被旁路的步骤保持 WAIT 并标记 `bypassed`，二者都不会进入 RUNNING。
//!
//! 叶子步骤流水线：
//! `before_execute` → 前置脚本 → `execute` → 后置脚本 → 变量赋值 → 断言，
//! 无论结果如何最后都调用 `after_execute`。取消在阶段边界检查。

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use atp_common::{InteractAsk, InteractPrompt, PromptKind, RunMessage, StepStatus};

use crate::adapter::{AdapterError, StepAdapter, StepContext};
use crate::assertion::{evaluate_all, read_source};
use crate::combination;
use crate::context::{ExtraConfig, RunContext, RunEvent};
use crate::definition::{AssignScope, CombinationKind, StepDefinition};
use crate::error::{ChildFailure, StepError};
use crate::result_tree::{NodeBase, SkipReason, StepResult};
use crate::sandbox::ScriptHook;
use crate::variables::VariableScope;

/// 单个步骤的执行产出
#[derive(Debug, Default)]
pub(crate) struct StepRun {
    pub extra: Option<Value>,
    pub detail: Option<Value>,
    pub response_error: Option<String>,
    pub error: Option<StepError>,
}

impl StepRun {
    pub fn failed(error: StepError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// 执行一个步骤（递归入口）
///
/// 返回最终状态；未能开始（结果树已停止）时返回 `Wait`。
pub fn run_step<'a>(
    ctx: &'a RunContext,
    definition: &'a StepDefinition,
    extra: ExtraConfig,
    parent_scope: &'a VariableScope,
) -> BoxFuture<'a, StepStatus> {
    async move {
        let tree = ctx.tree();

        if definition.disabled {
            debug!(step_id = %extra.id, "步骤已禁用");
            skip_step(ctx, definition, &extra, SkipReason::Disabled);
            return StepStatus::Skip;
        }

        let step_index = ctx.next_step_index();
        let running = NodeBase::for_step(definition, &extra, StepStatus::Running).with_step_index(step_index);
        if !tree.record_base(running) {
            return StepStatus::Wait;
        }

        debug!(step_id = %extra.id, step_index, "开始执行步骤: {}", definition.display_name());
        let started = Instant::now();
        let mut scope = parent_scope.child();

        let mut run = match definition.combination() {
            Some(kind) => combination::run(ctx, definition, kind, &extra, &mut scope).await,
            None => execute_leaf(ctx, definition, &extra, &mut scope, step_index).await,
        };

        if run.error.is_none() && !definition.interact.is_empty() {
            if let Err(e) = wait_interact(ctx, definition, &extra, &mut scope, step_index).await {
                run.error = Some(e);
            }
        }

        let status = if run.error.is_some() {
            StepStatus::Error
        } else {
            StepStatus::Done
        };

        match &run.error {
            Some(e) => warn!(step_id = %extra.id, "步骤失败: {}", e),
            None => debug!(step_id = %extra.id, "步骤完成"),
        }

        let (errors, error_kind) = match &run.error {
            Some(e) => (e.messages(), Some(e.kind().to_string())),
            None => (Vec::new(), None),
        };
        tree.record_result(
            &extra.id,
            StepResult {
                status,
                errors,
                error_kind,
                elapsed_ms: started.elapsed().as_millis() as u64,
                extra: run.extra,
                response_error: run.response_error,
                detail: run.detail,
            },
        );

        ctx.emit(RunEvent::Message(RunMessage::StepUpdate {
            step_id: extra.id.clone(),
            status,
        }));

        status
    }
    .boxed()
}

/// 顺序执行一组兄弟步骤
///
/// 出错后（未设置忽略错误时）其余兄弟步骤被旁路。返回失败的子步骤。
pub async fn run_sequence(
    ctx: &RunContext,
    children: &[StepDefinition],
    parent: Option<&ExtraConfig>,
    group: Option<usize>,
    scope: &VariableScope,
) -> Result<Vec<ChildFailure>, StepError> {
    let mut failures = Vec::new();

    for (index, child) in children.iter().enumerate() {
        let extra = match (parent, group) {
            (None, _) => ExtraConfig::root(index),
            (Some(p), Some(g)) => p.grouped_child(g, index),
            (Some(p), None) => p.child(index),
        };

        if ctx.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        if !failures.is_empty() && !ctx.options().ignore_errors {
            bypass_step(ctx, child, &extra);
            continue;
        }

        if run_step(ctx, child, extra.clone(), scope).await == StepStatus::Error {
            failures.push(ChildFailure {
                group,
                index,
                id: extra.id,
            });
        }
    }

    Ok(failures)
}

/// 旁路步骤及其静态子步骤：保持 WAIT 并标记
pub(crate) fn bypass_step(ctx: &RunContext, definition: &StepDefinition, extra: &ExtraConfig) {
    debug!(step_id = %extra.id, "步骤被旁路");
    ctx.tree()
        .record_base(NodeBase::for_step(definition, extra, StepStatus::Wait).bypassed());
    for (child_extra, child) in static_children(definition, extra) {
        bypass_step(ctx, child, &child_extra);
    }
}

/// 跳过步骤及其静态子步骤
pub(crate) fn skip_step(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    reason: SkipReason,
) {
    ctx.tree()
        .record_base(NodeBase::for_step(definition, extra, StepStatus::Skip).skipped(reason));
    for (child_extra, child) in static_children(definition, extra) {
        skip_step(ctx, child, &child_extra, reason);
    }
}

/// 定义中静态可知的子步骤及其位置
///
/// 循环、轮询、数据驱动的子步骤按迭代动态生成，不在此列。
pub fn static_children<'d>(
    definition: &'d StepDefinition,
    extra: &ExtraConfig,
) -> Vec<(ExtraConfig, &'d StepDefinition)> {
    match definition.combination() {
        Some(CombinationKind::Condition) => definition
            .branches()
            .into_iter()
            .enumerate()
            .flat_map(|(b, branch)| {
                branch
                    .iter()
                    .enumerate()
                    .map(move |(i, child)| (extra.grouped_child(b, i), child))
            })
            .collect(),
        Some(kind) if kind.is_dynamic() => Vec::new(),
        _ => definition
            .children()
            .iter()
            .enumerate()
            .map(|(i, child)| (extra.child(i), child))
            .collect(),
    }
}

fn checkpoint(ctx: &RunContext) -> Result<(), StepError> {
    if ctx.is_cancelled() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

async fn execute_leaf(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &mut VariableScope,
    step_index: usize,
) -> StepRun {
    let builder = match ctx.registry().get(&definition.step_type).await {
        Ok(builder) => builder,
        Err(e) => return StepRun::failed(StepError::System(e.to_string())),
    };

    let mut adapter = builder.build(definition);
    let mut step_ctx = StepContext {
        run: ctx,
        extra,
        definition,
        scope,
        step_index,
    };

    let mut run = StepRun::default();
    let result = leaf_pipeline(adapter.as_mut(), &mut step_ctx, &mut run).await;
    adapter.after_execute(&mut step_ctx).await;

    run.extra = adapter.extra_result();
    if let Some(detail) = adapter.detail_result() {
        run.detail = Some(detail);
    }
    run.error = result.err();
    run
}

async fn leaf_pipeline(
    adapter: &mut dyn StepAdapter,
    ctx: &mut StepContext<'_>,
    run: &mut StepRun,
) -> Result<(), StepError> {
    let definition = ctx.definition;
    let run_ctx = ctx.run;
    let sandbox = Arc::clone(run_ctx.sandbox());

    checkpoint(run_ctx)?;
    adapter.before_execute(ctx).await.map_err(|e| match e {
        AdapterError::Step(e) => e,
        other => StepError::System(other.to_string()),
    })?;

    checkpoint(run_ctx)?;
    for (index, source) in definition.pre_scripts.iter().enumerate() {
        let mut hook = ScriptHook::new(&mut *ctx.scope).with_request(adapter.request_mut());
        sandbox
            .run(source, &mut hook)
            .await
            .map_err(|message| StepError::PreScript { index, message })?;
    }

    checkpoint(run_ctx)?;
    let response = match adapter.execute(ctx).await {
        Ok(response) => response,
        Err(AdapterError::Response { message, body }) => {
            run.detail = Some(json!({ "response": body }));
            if definition.asserts.is_empty() {
                return Err(StepError::Response(message));
            }
            run.response_error = Some(message);
            body
        }
        Err(AdapterError::Failed(message)) => return Err(StepError::Execute(message)),
        Err(AdapterError::Step(e)) => return Err(e),
    };
    if run.detail.is_none() {
        run.detail = Some(json!({ "response": response }));
    }

    checkpoint(run_ctx)?;
    for (index, source) in definition.post_scripts.iter().enumerate() {
        let mut hook = ScriptHook::new(&mut *ctx.scope)
            .with_request(adapter.request_mut())
            .with_response(Some(&response));
        sandbox
            .run(source, &mut hook)
            .await
            .map_err(|message| StepError::PostScript { index, message })?;
    }

    checkpoint(run_ctx)?;
    for (index, assignment) in definition.assignments.iter().enumerate() {
        let value = read_source(assignment.source, &assignment.path, Some(&response), &*ctx.scope)
            .or_else(|| assignment.default.clone())
            .ok_or_else(|| StepError::Assignment {
                index,
                message: format!("路径 '{}' 没有取到值", assignment.path),
            })?;

        ctx.scope.assign(&assignment.name, value.clone(), assignment.scope);
        if assignment.scope == AssignScope::Global {
            run_ctx.emit(RunEvent::SetGlobalVariable {
                name: assignment.name.clone(),
                value,
            });
        }
    }

    checkpoint(run_ctx)?;
    let failures = evaluate_all(&definition.asserts, Some(&response), &*ctx.scope);
    if !failures.is_empty() {
        return Err(StepError::Assert { failures });
    }

    Ok(())
}

fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true" | "ok" | "1" | "是" | "确认"
    )
}

async fn wait_interact(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &mut VariableScope,
    step_index: usize,
) -> Result<(), StepError> {
    let prompts: Vec<InteractPrompt> = definition
        .interact
        .iter()
        .map(|p| InteractPrompt {
            kind: p.kind,
            message: scope.replace(&p.message),
            variable: p.variable.clone(),
            expected: p.expected.as_ref().map(|e| scope.replace(e)),
        })
        .collect();

    ctx.tree().set_status(&extra.id, StepStatus::Interact);
    let answer = ctx.interact().listen(step_index);
    ctx.emit(RunEvent::InteractAsk(InteractAsk {
        step_index,
        step_id: extra.id.clone(),
        prompts: prompts.clone(),
    }));
    info!(step_id = %extra.id, step_index, "步骤等待交互应答");

    let answers = tokio::select! {
        answers = answer => answers.map_err(|_| StepError::Interact("交互通道已关闭".to_string()))?,
        _ = ctx.cancel_token().cancelled() => return Err(StepError::Cancelled),
    };

    for (index, prompt) in prompts.iter().enumerate() {
        let answer = answers.get(index).map(|a| a.trim()).unwrap_or("");
        match prompt.kind {
            PromptKind::Confirm => {
                let confirmed = is_affirmative(answer);
                if let Some(variable) = &prompt.variable {
                    scope.set_run(variable, json!(confirmed));
                }
                if !confirmed {
                    return Err(StepError::Interact(format!("提示 #{} 未被确认", index)));
                }
            }
            PromptKind::Input => {
                if let Some(variable) = &prompt.variable {
                    scope.set_run(variable, json!(answer));
                }
                if let Some(expected) = &prompt.expected {
                    if answer != expected {
                        return Err(StepError::Interact(format!(
                            "提示 #{} 输入 '{}' 与期望值 '{}' 不符",
                            index, answer, expected
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affirmative_answers() {
        assert!(is_affirmative("Yes"));
        assert!(is_affirmative(" y "));
        assert!(is_affirmative("确认"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn test_static_children_ids() {
        let condition = StepDefinition::new("condition").with_branches(vec![
            vec![StepDefinition::new("echo")],
            vec![StepDefinition::new("echo"), StepDefinition::new("echo")],
        ]);
        let ids: Vec<String> = static_children(&condition, &ExtraConfig::root(1))
            .into_iter()
            .map(|(e, _)| e.id)
            .collect();
        assert_eq!(ids, vec!["1.0:0", "1.1:0", "1.1:1"]);

        let group = StepDefinition::new("group").with_steps(vec![StepDefinition::new("echo")]);
        let ids: Vec<String> = static_children(&group, &ExtraConfig::root(0))
            .into_iter()
            .map(|(e, _)| e.id)
            .collect();
        assert_eq!(ids, vec!["0.0"]);

        let looped = StepDefinition::new("loop").with_steps(vec![StepDefinition::new("echo")]);
        assert!(static_children(&looped, &ExtraConfig::root(0)).is_empty());
    }
}
