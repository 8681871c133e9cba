//! 组合步骤控制器
//!
//! 组合类型是封闭集合，直接按 [`CombinationKind`] 分派：
//! `group`、`condition`、`loop`、`poll`、`dataset`。
//! 循环和数据驱动支持异步模式：每批最多 `batch_size` 个迭代并发，
//! 整批完成后才开始下一批。

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::context::{ExtraConfig, RunContext};
use crate::controller::{run_sequence, skip_step, StepRun};
use crate::definition::{CombinationKind, StepDefinition};
use crate::error::{ChildFailure, StepError};
use crate::result_tree::SkipReason;
use crate::variables::{as_number, is_truthy, VariableScope};

/// 执行组合步骤
pub(crate) async fn run(
    ctx: &RunContext,
    definition: &StepDefinition,
    kind: CombinationKind,
    extra: &ExtraConfig,
    scope: &mut VariableScope,
) -> StepRun {
    let result = match kind {
        CombinationKind::Group => run_group(ctx, definition, extra, scope).await,
        CombinationKind::Condition => run_condition(ctx, definition, extra, scope).await,
        CombinationKind::Loop => run_loop(ctx, definition, extra, scope).await,
        CombinationKind::Poll => run_poll(ctx, definition, extra, scope).await,
        CombinationKind::Dataset => run_dataset(ctx, definition, extra, scope).await,
    };

    match result {
        Ok(extra) => StepRun {
            extra,
            ..Default::default()
        },
        Err(error) => StepRun::failed(error),
    }
}

fn aggregate(failures: Vec<ChildFailure>) -> Result<(), StepError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(StepError::Combination { failures })
    }
}

async fn run_group(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
) -> Result<Option<Value>, StepError> {
    let failures = run_sequence(ctx, definition.children(), Some(extra), None, scope).await?;
    aggregate(failures)?;
    Ok(None)
}

async fn run_condition(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
) -> Result<Option<Value>, StepError> {
    let branches = definition.branches();
    let conditions = definition
        .config_field("conditions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    // 没有条件的分支视为 else
    let taken = (0..branches.len()).find(|&b| {
        conditions
            .get(b)
            .map(|condition| scope.evaluate(condition))
            .unwrap_or(true)
    });
    debug!(step_id = %extra.id, "条件分支命中: {:?}", taken);

    for (b, branch) in branches.iter().enumerate() {
        if Some(b) == taken {
            continue;
        }
        for (i, child) in branch.iter().enumerate() {
            skip_step(ctx, child, &extra.grouped_child(b, i), SkipReason::Condition);
        }
    }

    if let Some(b) = taken {
        let failures = run_sequence(ctx, branches[b], Some(extra), Some(b), scope).await?;
        aggregate(failures)?;
    }

    Ok(Some(json!({ "branch": taken })))
}

/// 一次迭代的计划
struct IterationPlan {
    locals: Vec<(String, Value)>,
    skip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationOutcome {
    Passed,
    Failed,
    Skipped,
}

fn config_usize(scope: &VariableScope, definition: &StepDefinition, key: &str) -> Option<usize> {
    definition
        .config_field(key)
        .map(|v| scope.resolve_value(v))
        .and_then(|v| as_number(&v))
        .map(|n| n.max(0.0) as usize)
}

fn config_bool(definition: &StepDefinition, key: &str) -> bool {
    definition.config_field(key).map(is_truthy).unwrap_or(false)
}

fn batch_size(ctx: &RunContext, scope: &VariableScope, definition: &StepDefinition) -> usize {
    config_usize(scope, definition, "batch_size")
        .unwrap_or(ctx.options().async_batch_size)
        .max(1)
}

async fn run_iteration(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
    group: usize,
    plan: IterationPlan,
) -> Result<(IterationOutcome, Vec<ChildFailure>), StepError> {
    if plan.skip {
        for (i, child) in definition.children().iter().enumerate() {
            skip_step(ctx, child, &extra.grouped_child(group, i), SkipReason::DatasetRow);
        }
        return Ok((IterationOutcome::Skipped, Vec::new()));
    }

    let mut iteration_scope = scope.child();
    for (name, value) in plan.locals {
        iteration_scope.set_local(&name, value);
    }

    let failures =
        run_sequence(ctx, definition.children(), Some(extra), Some(group), &iteration_scope).await?;
    let outcome = if failures.is_empty() {
        IterationOutcome::Passed
    } else {
        IterationOutcome::Failed
    };
    Ok((outcome, failures))
}

/// 执行全部迭代，返回失败的子步骤
///
/// 迭代计划按需生成，同一时刻最多持有一批。每个迭代或每批之后让出一次调度，
/// 不挂起的子步骤也不会挡住全局超时和取消。
async fn run_iterations(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
    plans: impl Iterator<Item = IterationPlan> + Send,
    parallel: Option<usize>,
    on_done: &(dyn Fn(IterationOutcome) + Sync),
) -> Result<Vec<ChildFailure>, StepError> {
    let mut failures = Vec::new();

    match parallel {
        None => {
            for (group, plan) in plans.enumerate() {
                if ctx.is_cancelled() {
                    return Err(StepError::Cancelled);
                }
                let (outcome, mut failed) =
                    run_iteration(ctx, definition, extra, scope, group, plan).await?;
                on_done(outcome);
                failures.append(&mut failed);
                tokio::task::yield_now().await;
            }
        }
        Some(batch) => {
            let mut plans = plans.enumerate().peekable();
            while plans.peek().is_some() {
                if ctx.is_cancelled() {
                    return Err(StepError::Cancelled);
                }
                let pass: Vec<_> = plans.by_ref().take(batch).collect();
                debug!(step_id = %extra.id, "异步执行 {} 个迭代", pass.len());

                let results = join_all(pass.into_iter().map(|(group, plan)| {
                    run_iteration(ctx, definition, extra, scope, group, plan)
                }))
                .await;

                let mut cancelled = false;
                for result in results {
                    match result {
                        Ok((outcome, mut failed)) => {
                            on_done(outcome);
                            failures.append(&mut failed);
                        }
                        Err(_) => cancelled = true,
                    }
                }
                if cancelled {
                    return Err(StepError::Cancelled);
                }
                tokio::task::yield_now().await;
            }
        }
    }

    Ok(failures)
}

async fn run_loop(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
) -> Result<Option<Value>, StepError> {
    let count = config_usize(scope, definition, "count")
        .ok_or_else(|| StepError::Execute("loop 步骤缺少有效的 count 配置".to_string()))?;
    let variable = definition
        .config_field("variable")
        .and_then(Value::as_str)
        .unwrap_or("index")
        .to_string();
    let parallel = config_bool(definition, "async").then(|| batch_size(ctx, scope, definition));

    info!(step_id = %extra.id, "循环 {} 次 (异步批次: {:?})", count, parallel);

    let plans = (0..count).map(|i| IterationPlan {
        locals: vec![(variable.clone(), json!(i))],
        skip: false,
    });

    let failures = run_iterations(ctx, definition, extra, scope, plans, parallel, &|_| {}).await?;
    aggregate(failures)?;
    Ok(Some(json!({ "iterations": count })))
}

async fn run_poll(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
) -> Result<Option<Value>, StepError> {
    let max_attempts = config_usize(scope, definition, "max_attempts").unwrap_or(3).max(1);
    let interval = Duration::from_millis(
        config_usize(scope, definition, "interval_ms").unwrap_or(1000) as u64,
    );
    let until = definition.config_field("until");

    let mut last_failures = Vec::new();
    for attempt in 0..max_attempts {
        if ctx.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let mut attempt_scope = scope.child();
        attempt_scope.set_local("attempt", json!(attempt));

        let failures = run_sequence(
            ctx,
            definition.children(),
            Some(extra),
            Some(attempt),
            &attempt_scope,
        )
        .await?;

        let satisfied = failures.is_empty()
            && until
                .map(|condition| attempt_scope.evaluate(condition))
                .unwrap_or(true);
        if satisfied {
            debug!(step_id = %extra.id, "轮询在第 {} 次满足条件", attempt + 1);
            return Ok(Some(json!({ "attempts": attempt + 1 })));
        }
        last_failures = failures;

        if attempt + 1 < max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.cancel_token().cancelled() => return Err(StepError::Cancelled),
            }
        }
    }

    aggregate(last_failures)?;
    Err(StepError::Execute(format!(
        "轮询 {} 次后条件仍未满足",
        max_attempts
    )))
}

async fn run_dataset(
    ctx: &RunContext,
    definition: &StepDefinition,
    extra: &ExtraConfig,
    scope: &VariableScope,
) -> Result<Option<Value>, StepError> {
    let rows = match definition.config_field("rows").map(|v| scope.resolve_value(v)) {
        Some(Value::Array(rows)) => rows,
        Some(_) => return Err(StepError::Execute("dataset 的 rows 必须是数组".to_string())),
        None => Vec::new(),
    };
    let parallel = config_bool(definition, "async").then(|| batch_size(ctx, scope, definition));

    info!(step_id = %extra.id, "数据驱动 {} 行 (异步批次: {:?})", rows.len(), parallel);
    ctx.update_dataset(|c| c.total += rows.len());

    let plans = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            let mut locals = vec![
                ("row".to_string(), row.clone()),
                ("row_index".to_string(), json!(index)),
            ];
            let mut skip = false;
            if let Value::Object(fields) = &row {
                skip = fields.get("_skip").map(is_truthy).unwrap_or(false);
                locals.extend(
                    fields
                        .iter()
                        .filter(|(k, _)| k.as_str() != "_skip")
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
            IterationPlan { locals, skip }
        });

    let summary = std::sync::Mutex::new(Map::new());
    let on_done = |outcome: IterationOutcome| {
        let key = match outcome {
            IterationOutcome::Passed => "passed",
            IterationOutcome::Failed => "failed",
            IterationOutcome::Skipped => "skipped",
        };
        ctx.update_dataset(|c| match outcome {
            IterationOutcome::Passed => c.passed += 1,
            IterationOutcome::Failed => c.failed += 1,
            IterationOutcome::Skipped => c.skipped += 1,
        });
        let mut summary = summary
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = summary.get(key).and_then(Value::as_u64).unwrap_or(0);
        summary.insert(key.to_string(), json!(count + 1));
    };

    let failures = run_iterations(ctx, definition, extra, scope, plans, parallel, &on_done).await?;
    aggregate(failures)?;

    let summary = summary
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    Ok(Some(Value::Object(summary)))
}
