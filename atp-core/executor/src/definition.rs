//! 运行与步骤定义

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub use atp_common::InteractPrompt;

/// 一次运行的定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunDefinition {
    /// 运行名称
    #[serde(default)]
    pub name: String,

    /// 全局超时（毫秒），覆盖运行选项中的默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// 运行级初始变量
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,

    /// 顶层步骤
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl RunDefinition {
    /// 从 YAML 文件加载
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// 从 YAML 字符串加载
    pub fn from_yaml_str(yaml: &str) -> crate::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::ExecutorError::DefinitionLoadFailed(e.to_string()))
    }

    /// 从 JSON 字符串加载
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::ExecutorError::DefinitionLoadFailed(e.to_string()))
    }

    /// 从 JSON 字节加载
    pub fn from_json_slice(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::ExecutorError::DefinitionLoadFailed(e.to_string()))
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::ExecutorError::SerdeError(e.to_string()))
    }
}

/// 步骤定义（运行期间不可变）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// 步骤类型：组合类型或已注册的适配器标签
    #[serde(rename = "type")]
    pub step_type: String,

    /// 步骤名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// 是否禁用
    #[serde(default)]
    pub disabled: bool,

    /// 子步骤
    #[serde(default, skip_serializing_if = "StepChildren::is_none")]
    pub steps: StepChildren,

    /// 交互提示（步骤成功后进入 INTERACT）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interact: Vec<InteractPrompt>,

    /// 前置脚本
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_scripts: Vec<String>,

    /// 后置脚本
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_scripts: Vec<String>,

    /// 变量赋值
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,

    /// 断言
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asserts: Vec<AssertDecl>,

    /// 运行前需要预取的资源文件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,

    /// 适配器或组合控制器的专属配置
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl StepDefinition {
    /// 创建指定类型的空步骤
    pub fn new(step_type: &str) -> Self {
        Self {
            step_type: step_type.to_string(),
            name: None,
            disabled: false,
            steps: StepChildren::None,
            interact: Vec::new(),
            pre_scripts: Vec::new(),
            post_scripts: Vec::new(),
            assignments: Vec::new(),
            asserts: Vec::new(),
            resources: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepDefinition>) -> Self {
        self.steps = StepChildren::Flat(steps);
        self
    }

    pub fn with_branches(mut self, branches: Vec<Vec<StepDefinition>>) -> Self {
        self.steps = StepChildren::Branches(branches);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// 组合类型（非组合类型返回 None）
    pub fn combination(&self) -> Option<CombinationKind> {
        CombinationKind::from_type(&self.step_type)
    }

    /// 读取配置字段
    pub fn config_field(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// 平铺子步骤（分支形式时返回第一个分支）
    pub fn children(&self) -> &[StepDefinition] {
        match &self.steps {
            StepChildren::None => &[],
            StepChildren::Flat(steps) => steps,
            StepChildren::Branches(branches) => branches.first().map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// 分支形式的子步骤（平铺形式视为单个分支）
    pub fn branches(&self) -> Vec<&[StepDefinition]> {
        match &self.steps {
            StepChildren::None => Vec::new(),
            StepChildren::Flat(steps) => vec![steps.as_slice()],
            StepChildren::Branches(branches) => branches.iter().map(Vec::as_slice).collect(),
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_type)
    }
}

/// 子步骤的形状
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum StepChildren {
    /// 无子步骤
    #[default]
    None,
    /// 分支（数组的数组）
    Branches(Vec<Vec<StepDefinition>>),
    /// 平铺
    Flat(Vec<StepDefinition>),
}

impl StepChildren {
    pub fn is_none(&self) -> bool {
        matches!(self, StepChildren::None)
    }
}

/// 组合步骤类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationKind {
    /// 顺序执行的静态分组
    Group,
    /// 条件分支
    Condition,
    /// 循环
    Loop,
    /// 轮询直到条件满足
    Poll,
    /// 数据驱动
    Dataset,
}

impl CombinationKind {
    pub fn from_type(step_type: &str) -> Option<Self> {
        match step_type {
            "group" => Some(Self::Group),
            "condition" => Some(Self::Condition),
            "loop" => Some(Self::Loop),
            "poll" => Some(Self::Poll),
            "dataset" => Some(Self::Dataset),
            _ => None,
        }
    }

    /// 子步骤是否按迭代动态生成
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Loop | Self::Poll | Self::Dataset)
    }

    /// 子步骤是否按分组编号
    pub fn is_grouped(&self) -> bool {
        !matches!(self, Self::Group)
    }
}

/// 取值来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// 步骤响应
    #[default]
    Response,
    /// 变量
    Variable,
}

/// 变量作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssignScope {
    /// 仅当前步骤
    Local,
    /// 当前运行
    #[default]
    Run,
    /// 全局（同时通知调度器）
    Global,
}

/// 变量赋值声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    /// 变量名
    pub name: String,

    /// 取值来源
    #[serde(default)]
    pub source: ValueSource,

    /// 取值路径（点号分隔）
    #[serde(default)]
    pub path: String,

    /// 作用域
    #[serde(default)]
    pub scope: AssignScope,

    /// 取值失败时的默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// 断言运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssertOp {
    #[default]
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
    Exists,
    Truthy,
}

/// 断言声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertDecl {
    /// 取值来源
    #[serde(default)]
    pub source: ValueSource,

    /// 取值路径
    #[serde(default)]
    pub path: String,

    /// 运算符
    #[serde(default)]
    pub op: AssertOp,

    /// 期望值（支持变量替换）
    #[serde(default)]
    pub expected: Value,
}

/// 资源引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRef {
    /// 资源来源（本地路径或 file:// URI）
    pub source: String,

    /// 缓存中的文件名
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_and_branches() {
        let yaml = r#"
name: demo
steps:
  - type: group
    steps:
      - type: echo
      - type: wait
        config: { ms: 10 }
  - type: condition
    config:
      conditions: ["{{flag}}"]
    steps:
      - - type: echo
      - - type: echo
        - type: echo
"#;
        let run = RunDefinition::from_yaml_str(yaml).unwrap();
        assert_eq!(run.name, "demo");
        assert_eq!(run.steps.len(), 2);

        assert!(matches!(run.steps[0].steps, StepChildren::Flat(ref s) if s.len() == 2));
        assert_eq!(run.steps[0].combination(), Some(CombinationKind::Group));

        let branches = run.steps[1].branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[1].len(), 2);
    }

    #[test]
    fn test_defaults() {
        let step: StepDefinition = serde_json::from_str(r#"{"type": "echo"}"#).unwrap();
        assert!(!step.disabled);
        assert!(step.steps.is_none());
        assert!(step.config.is_null());
        assert!(step.combination().is_none());

        let assign: Assignment = serde_json::from_str(r#"{"name": "token"}"#).unwrap();
        assert_eq!(assign.scope, AssignScope::Run);
        assert_eq!(assign.source, ValueSource::Response);
    }

    #[test]
    fn test_flat_children_as_single_branch() {
        let step = StepDefinition::new("condition").with_steps(vec![StepDefinition::new("echo")]);
        assert_eq!(step.branches().len(), 1);
        assert_eq!(step.children().len(), 1);
    }
}
