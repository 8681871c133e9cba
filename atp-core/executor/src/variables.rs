//! 变量存储与作用域
//!
//! 模板语法为 `{{name}}`，名称支持点号路径（`user.id`、`items.0`）。
//! 未定义的占位符原样保留。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::definition::AssignScope;

/// 变量表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(Map<String, Value>);

impl Variables {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// 读取变量，支持点号路径
    pub fn get(&self, name: &str) -> Option<&Value> {
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name, None),
        };
        let root = self.0.get(head)?;
        match rest {
            Some(path) => lookup_path(root, path),
            None => Some(root),
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 合并另一张变量表（覆盖同名变量）
    pub fn extend(&mut self, other: &Variables) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// 在本表内替换模板
    pub fn replace(&self, template: &str) -> String {
        substitute(template, |name| self.get(name).cloned())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Variables {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// 运行内共享的变量（运行级 + 环境级）
#[derive(Debug, Default)]
pub struct SharedVariables {
    run: RwLock<Variables>,
    env: RwLock<Variables>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl SharedVariables {
    pub fn new(run: Variables, env: Variables) -> Self {
        Self {
            run: RwLock::new(run),
            env: RwLock::new(env),
        }
    }

    pub fn get_run(&self, name: &str) -> Option<Value> {
        read(&self.run).get(name).cloned()
    }

    pub fn get_env(&self, name: &str) -> Option<Value> {
        read(&self.env).get(name).cloned()
    }

    pub fn set_run(&self, name: &str, value: Value) {
        write(&self.run).set(name, value);
    }

    pub fn set_env(&self, name: &str, value: Value) {
        write(&self.env).set(name, value);
    }

    /// 运行级变量快照
    pub fn run_snapshot(&self) -> Variables {
        read(&self.run).clone()
    }

    /// 环境级变量快照
    pub fn env_snapshot(&self) -> Variables {
        read(&self.env).clone()
    }
}

/// 步骤级变量作用域
///
/// 持有局部变量快照；读取顺序为 局部 → 运行级 → 环境级。
#[derive(Debug, Clone)]
pub struct VariableScope {
    locals: Variables,
    shared: Arc<SharedVariables>,
}

impl VariableScope {
    pub fn new(shared: Arc<SharedVariables>) -> Self {
        Self {
            locals: Variables::new(),
            shared,
        }
    }

    /// 派生子作用域（复制局部变量快照）
    pub fn child(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.locals
            .get(name)
            .cloned()
            .or_else(|| self.shared.get_run(name))
            .or_else(|| self.shared.get_env(name))
    }

    pub fn set_local(&mut self, name: &str, value: Value) {
        self.locals.set(name, value);
    }

    pub fn set_run(&self, name: &str, value: Value) {
        self.shared.set_run(name, value);
    }

    pub fn set_env(&self, name: &str, value: Value) {
        self.shared.set_env(name, value);
    }

    /// 按作用域写入变量
    pub fn assign(&mut self, name: &str, value: Value, scope: AssignScope) {
        match scope {
            AssignScope::Local => self.set_local(name, value),
            AssignScope::Run => self.set_run(name, value),
            AssignScope::Global => self.set_env(name, value),
        }
    }

    pub fn locals(&self) -> &Variables {
        &self.locals
    }

    pub fn shared(&self) -> &Arc<SharedVariables> {
        &self.shared
    }

    /// 替换字符串模板
    pub fn replace(&self, template: &str) -> String {
        substitute(template, |name| self.get(name))
    }

    /// 递归替换 JSON 值中的模板
    ///
    /// 字符串恰好是单个占位符时保留变量的原始类型。
    pub fn resolve_value(&self, value: &Value) -> Value {
        resolve_with(value, &|name| self.get(name))
    }

    /// 计算条件表达式
    pub fn evaluate(&self, condition: &Value) -> bool {
        match condition {
            Value::String(expr) => evaluate_expression(&self.replace(expr)),
            other => is_truthy(&self.resolve_value(other)),
        }
    }
}

/// 按点号路径读取 JSON 值；空路径或 `$` 返回根值
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(root);
    }
    let path = path.strip_prefix("$.").unwrap_or(path);

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 按点号路径写入 JSON 值，中间对象按需创建
pub fn set_path(root: &mut Value, path: &str, value: Value) -> bool {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return true;
    };

    let mut current = root;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return false,
            },
            _ => return false,
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            true
        }
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(item) => {
                *item = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// 将 JSON 值渲染为模板文本
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 替换 `{{name}}` 占位符
pub fn substitute<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match lookup(name) {
                    Some(value) => output.push_str(&value_to_text(&value)),
                    None => output.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// 字符串是否恰好为单个占位符，返回变量名
fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

pub(crate) fn resolve_with(value: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
    match value {
        Value::String(text) => {
            if let Some(name) = sole_placeholder(text) {
                if let Some(found) = lookup(name) {
                    return found;
                }
            }
            Value::String(substitute(text, lookup))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_with(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_with(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 解析字面量：合法 JSON 按 JSON 解析，否则视为字符串
pub fn parse_literal(text: &str) -> Value {
    let text = text.trim();
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// JSON 值的真值判断
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0" || s == "null")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// 宽松比较：数字按数值，其余按文本
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => value_to_text(left) == value_to_text(right),
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// 计算已替换的条件表达式
///
/// 支持 `==`、`!=`、`>=`、`<=`、`>`、`<`，否则按真值判断。
pub fn evaluate_expression(expr: &str) -> bool {
    const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

    for op in OPERATORS {
        if let Some((left, right)) = expr.split_once(op) {
            let left = parse_literal(left);
            let right = parse_literal(right);
            return match op {
                "==" => loose_eq(&left, &right),
                "!=" => !loose_eq(&left, &right),
                _ => match (as_number(&left), as_number(&right)) {
                    (Some(a), Some(b)) => match op {
                        ">=" => a >= b,
                        "<=" => a <= b,
                        ">" => a > b,
                        _ => a < b,
                    },
                    _ => false,
                },
            };
        }
    }
    is_truthy(&parse_literal(expr))
}
