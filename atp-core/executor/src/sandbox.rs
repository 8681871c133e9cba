//! 脚本沙箱接口
//!
//! 引擎只依赖 "执行脚本 → 值或错误" 这一接口。
//! [`ExpressionSandbox`] 是内置的行式实现，无需外部脚本运行时即可使用。

use async_trait::async_trait;
use serde_json::Value;

use crate::variables::{lookup_path, parse_literal, resolve_with, set_path, VariableScope};

/// 脚本可访问的步骤上下文
pub struct ScriptHook<'a> {
    /// 待发送的请求（前置脚本可修改）
    pub request: Option<&'a mut Value>,

    /// 步骤响应（后置脚本可读取）
    pub response: Option<&'a Value>,

    /// 变量作用域
    pub scope: &'a mut VariableScope,
}

impl<'a> ScriptHook<'a> {
    pub fn new(scope: &'a mut VariableScope) -> Self {
        Self {
            request: None,
            response: None,
            scope,
        }
    }

    pub fn with_request(mut self, request: Option<&'a mut Value>) -> Self {
        self.request = request;
        self
    }

    pub fn with_response(mut self, response: Option<&'a Value>) -> Self {
        self.response = response;
        self
    }

    /// 读取变量，`response.` / `request.` 前缀指向当前步骤数据
    fn lookup(&self, name: &str) -> Option<Value> {
        if name == "response" {
            return self.response.cloned();
        }
        if let Some(path) = name.strip_prefix("response.") {
            return self.response.and_then(|r| lookup_path(r, path)).cloned();
        }
        if let Some(path) = name.strip_prefix("request.") {
            return self
                .request
                .as_deref()
                .and_then(|r| lookup_path(r, path))
                .cloned();
        }
        self.scope.get(name)
    }

    /// 替换模板并解析为字面量
    pub fn evaluate(&self, text: &str) -> Value {
        let literal = parse_literal(text);
        resolve_with(&literal, &|name| self.lookup(name))
    }
}

/// 脚本沙箱
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    /// 执行脚本，返回脚本结果或错误描述
    async fn run(&self, source: &str, hook: &mut ScriptHook<'_>) -> Result<Value, String>;
}

/// 行式表达式沙箱
///
/// 每行一条语句：
/// - `set NAME = VALUE`：写入运行级变量
/// - `local NAME = VALUE`：写入局部变量
/// - `request.PATH = VALUE`：修改待发送的请求
/// - `fail MESSAGE`：以错误结束
/// - `return VALUE`：立即返回
///
/// 空行和 `#` 开头的行被忽略。
#[derive(Debug, Default, Clone)]
pub struct ExpressionSandbox;

impl ExpressionSandbox {
    pub fn new() -> Self {
        Self
    }

    fn split_assignment(statement: &str) -> Result<(&str, &str), String> {
        statement
            .split_once('=')
            .map(|(name, value)| (name.trim(), value.trim()))
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| format!("赋值语句格式错误: {}", statement))
    }
}

#[async_trait]
impl ScriptSandbox for ExpressionSandbox {
    async fn run(&self, source: &str, hook: &mut ScriptHook<'_>) -> Result<Value, String> {
        let mut last = Value::Null;

        for line in source.lines() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with('#') {
                continue;
            }

            if let Some(rest) = statement.strip_prefix("set ") {
                let (name, value) = Self::split_assignment(rest)?;
                let value = hook.evaluate(value);
                hook.scope.set_run(name, value.clone());
                last = value;
            } else if let Some(rest) = statement.strip_prefix("local ") {
                let (name, value) = Self::split_assignment(rest)?;
                let value = hook.evaluate(value);
                hook.scope.set_local(name, value.clone());
                last = value;
            } else if let Some(rest) = statement.strip_prefix("request.") {
                let (path, value) = Self::split_assignment(rest)?;
                let value = hook.evaluate(value);
                let request = hook
                    .request
                    .as_deref_mut()
                    .ok_or_else(|| "当前步骤没有可修改的请求".to_string())?;
                if !set_path(request, path, value.clone()) {
                    return Err(format!("无法写入请求路径: {}", path));
                }
                last = value;
            } else if let Some(message) = statement.strip_prefix("fail") {
                let message = hook.scope.replace(message.trim());
                return Err(if message.is_empty() {
                    "脚本主动失败".to_string()
                } else {
                    message
                });
            } else if let Some(value) = statement.strip_prefix("return ") {
                return Ok(hook.evaluate(value));
            } else {
                return Err(format!("无法识别的脚本语句: {}", statement));
            }
        }

        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{SharedVariables, Variables};
    use serde_json::json;
    use std::sync::Arc;

    fn scope() -> VariableScope {
        VariableScope::new(Arc::new(SharedVariables::new(Variables::new(), Variables::new())))
    }

    #[tokio::test]
    async fn test_set_and_return() {
        let mut scope = scope();
        let sandbox = ExpressionSandbox::new();
        let mut hook = ScriptHook::new(&mut scope);

        let value = sandbox
            .run("# comment\nset count = 3\nlocal name = \"bob\"\nreturn {{count}}", &mut hook)
            .await
            .unwrap();
        assert_eq!(value, json!(3));
        assert_eq!(scope.get("count"), Some(json!(3)));
        assert_eq!(scope.get("name"), Some(json!("bob")));
    }

    #[tokio::test]
    async fn test_modify_request_and_read_response() {
        let mut scope = scope();
        let mut request = json!({"url": "/a"});
        let response = json!({"body": {"token": "t-1"}});
        let sandbox = ExpressionSandbox::new();

        {
            let mut hook = ScriptHook::new(&mut scope)
                .with_request(Some(&mut request))
                .with_response(Some(&response));
            sandbox
                .run("request.headers.auth = {{response.body.token}}\nset token = {{response.body.token}}", &mut hook)
                .await
                .unwrap();
        }

        assert_eq!(request["headers"]["auth"], json!("t-1"));
        assert_eq!(scope.get("token"), Some(json!("t-1")));
    }

    #[tokio::test]
    async fn test_fail_and_unknown_statement() {
        let mut scope = scope();
        let sandbox = ExpressionSandbox::new();

        let mut hook = ScriptHook::new(&mut scope);
        let err = sandbox.run("fail boom", &mut hook).await.unwrap_err();
        assert_eq!(err, "boom");

        let mut hook = ScriptHook::new(&mut scope);
        assert!(sandbox.run("explode()", &mut hook).await.is_err());

        let mut hook = ScriptHook::new(&mut scope);
        assert!(sandbox.run("request.x = 1", &mut hook).await.is_err());
    }
}
