//! 内置适配器
//!
//! - `wait`：休眠 `config.ms` 毫秒
//! - `echo`：返回 `config.response`；`config.status >= 400` 视为响应错误，
//!   `config.error` 视为执行失败
//! - `script`：在沙箱中执行 `config.source`

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::adapter::{AdapterBuilder, AdapterError, StepAdapter, StepContext};
use crate::definition::StepDefinition;
use crate::sandbox::ScriptHook;
use crate::variables::{as_number, value_to_text};

/// `wait` 构建器
#[derive(Debug, Default, Clone)]
pub struct WaitBuilder;

impl AdapterBuilder for WaitBuilder {
    fn build(&self, _definition: &StepDefinition) -> Box<dyn StepAdapter> {
        Box::new(WaitAdapter { waited_ms: 0 })
    }
}

struct WaitAdapter {
    waited_ms: u64,
}

#[async_trait]
impl StepAdapter for WaitAdapter {
    async fn execute(&mut self, ctx: &mut StepContext<'_>) -> Result<Value, AdapterError> {
        let config = ctx.resolved_config();
        let ms = config
            .get("ms")
            .and_then(as_number)
            .ok_or_else(|| AdapterError::Failed("wait 步骤缺少 ms 配置".to_string()))?;
        let ms = ms.max(0.0) as u64;

        debug!("步骤 {} 等待 {}ms", ctx.extra.id, ms);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.run.cancel_token().cancelled() => {
                return Err(AdapterError::Step(crate::StepError::Cancelled));
            }
        }

        self.waited_ms = ms;
        Ok(json!({ "waited_ms": ms }))
    }

    fn extra_result(&self) -> Option<Value> {
        Some(json!({ "waited_ms": self.waited_ms }))
    }
}

/// `echo` 构建器
#[derive(Debug, Default, Clone)]
pub struct EchoBuilder;

impl AdapterBuilder for EchoBuilder {
    fn build(&self, definition: &StepDefinition) -> Box<dyn StepAdapter> {
        Box::new(EchoAdapter {
            request: definition.config.clone(),
            response: None,
        })
    }

    fn create_init_result(&self, definition: &StepDefinition) -> Option<Value> {
        definition
            .config_field("status")
            .map(|status| json!({ "status": status }))
    }
}

struct EchoAdapter {
    request: Value,
    response: Option<Value>,
}

#[async_trait]
impl StepAdapter for EchoAdapter {
    async fn before_execute(&mut self, ctx: &mut StepContext<'_>) -> Result<(), AdapterError> {
        if !self.request.is_null() && !self.request.is_object() {
            return Err(AdapterError::Failed("echo 配置必须是对象".to_string()));
        }
        self.request = ctx.scope.resolve_value(&self.request);
        Ok(())
    }

    fn request_mut(&mut self) -> Option<&mut Value> {
        Some(&mut self.request)
    }

    async fn execute(&mut self, _ctx: &mut StepContext<'_>) -> Result<Value, AdapterError> {
        if let Some(error) = self.request.get("error") {
            return Err(AdapterError::Failed(value_to_text(error)));
        }

        let body = self.request.get("response").cloned().unwrap_or(Value::Null);
        self.response = Some(body.clone());

        let status = self.request.get("status").and_then(as_number).unwrap_or(200.0);
        if status >= 400.0 {
            return Err(AdapterError::Response {
                message: format!("响应状态码 {}", status as u64),
                body,
            });
        }
        Ok(body)
    }

    fn extra_result(&self) -> Option<Value> {
        self.request.get("status").map(|status| json!({ "status": status }))
    }

    fn detail_result(&self) -> Option<Value> {
        Some(json!({
            "request": self.request,
            "response": self.response,
        }))
    }
}

/// `script` 构建器
#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder;

impl AdapterBuilder for ScriptBuilder {
    fn build(&self, definition: &StepDefinition) -> Box<dyn StepAdapter> {
        let source = definition
            .config_field("source")
            .map(value_to_text)
            .unwrap_or_default();
        Box::new(ScriptAdapter { source })
    }
}

struct ScriptAdapter {
    source: String,
}

#[async_trait]
impl StepAdapter for ScriptAdapter {
    async fn execute(&mut self, ctx: &mut StepContext<'_>) -> Result<Value, AdapterError> {
        let sandbox = std::sync::Arc::clone(ctx.run.sandbox());
        let mut hook = ScriptHook::new(&mut *ctx.scope);
        sandbox
            .run(&self.source, &mut hook)
            .await
            .map_err(AdapterError::Failed)
    }
}
