//! 断言求值

use serde_json::Value;

use crate::definition::{AssertDecl, AssertOp, ValueSource};
use crate::error::AssertFailure;
use crate::variables::{as_number, is_truthy, lookup_path, loose_eq, value_to_text, VariableScope};

/// 按来源读取实际值
pub(crate) fn read_source(
    source: ValueSource,
    path: &str,
    response: Option<&Value>,
    scope: &VariableScope,
) -> Option<Value> {
    match source {
        ValueSource::Response => response.and_then(|r| lookup_path(r, path)).cloned(),
        ValueSource::Variable => scope.get(path),
    }
}

/// 对单条断言求值，失败时返回描述
pub fn check(decl: &AssertDecl, actual: Option<&Value>, expected: &Value) -> Result<(), String> {
    let passed = match decl.op {
        AssertOp::Exists => actual.is_some(),
        AssertOp::Truthy => actual.map(is_truthy).unwrap_or(false),
        AssertOp::Eq => actual.map(|a| loose_eq(a, expected)).unwrap_or(expected.is_null()),
        AssertOp::Ne => !actual.map(|a| loose_eq(a, expected)).unwrap_or(expected.is_null()),
        AssertOp::Contains => actual.map(|a| contains(a, expected)).unwrap_or(false),
        AssertOp::Gt | AssertOp::Lt => match (actual.and_then(as_number), as_number(expected)) {
            (Some(a), Some(b)) if decl.op == AssertOp::Gt => a > b,
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    };

    if passed {
        return Ok(());
    }

    let actual_text = actual
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<不存在>".to_string());
    Err(format!(
        "{} {:?} {}: 实际值 {}",
        if decl.path.is_empty() { "$" } else { decl.path.as_str() },
        decl.op,
        expected,
        actual_text
    ))
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_to_text(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_text(needle)),
        _ => false,
    }
}

/// 依次求值全部断言，收集所有失败项
pub fn evaluate_all(
    asserts: &[AssertDecl],
    response: Option<&Value>,
    scope: &VariableScope,
) -> Vec<AssertFailure> {
    asserts
        .iter()
        .enumerate()
        .filter_map(|(index, decl)| {
            let actual = read_source(decl.source, &decl.path, response, scope);
            let expected = scope.resolve_value(&decl.expected);
            check(decl, actual.as_ref(), &expected)
                .err()
                .map(|message| AssertFailure { index, message })
        })
        .collect()
}
