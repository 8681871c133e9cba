//! 批次文件
//!
//! YAML/JSON 文件描述一个批次：
//!
//! ```yaml
//! env: { host: example.org }
//! ignore_errors: false
//! no_detail: false
//! runs:
//!   - mode: sync
//!     name: 登录
//!     timeout_ms: 30000
//!     steps: [...]
//! ```
//!
//! `.atb` 文件按二进制批次格式直接读取。

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use atp_common::TaskMode;
use atp_executor::{RunDefinition, OPTION_IGNORE_ERRORS, OPTION_NO_DETAIL};
use atp_scheduler::Batch;

/// 批次文件内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFile {
    /// 批次共享的环境变量
    #[serde(default)]
    pub env: Map<String, Value>,

    #[serde(default)]
    pub ignore_errors: bool,

    #[serde(default)]
    pub no_detail: bool,

    #[serde(default)]
    pub runs: Vec<RunEntry>,
}

/// 批次中的一个运行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntry {
    #[serde(default)]
    pub mode: TaskMode,

    #[serde(flatten)]
    pub definition: RunDefinition,
}

impl BatchFile {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("解析 YAML 批次文件失败")
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("解析 JSON 批次文件失败")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("读取批次文件失败: {:?}", path))?;
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => anyhow::bail!("不支持的批次文件格式，仅支持 .yaml/.yml、.json 或 .atb"),
        }
    }

    /// 批次选项位
    pub fn options(&self) -> u32 {
        let mut bits = 0;
        if self.ignore_errors {
            bits |= OPTION_IGNORE_ERRORS;
        }
        if self.no_detail {
            bits |= OPTION_NO_DETAIL;
        }
        bits
    }

    pub fn to_batch(&self) -> Result<Batch> {
        let mut batch = Batch::new(self.env.clone(), self.options());
        for (i, run) in self.runs.iter().enumerate() {
            batch
                .push(run.mode, &run.definition)
                .with_context(|| format!("编码运行 {} 失败", i))?;
        }
        Ok(batch)
    }
}

/// 从文件加载批次
pub fn load_batch(path: &Path) -> Result<Batch> {
    if path.extension().and_then(|s| s.to_str()) == Some("atb") {
        let bytes = fs::read(path).with_context(|| format!("读取批次文件失败: {:?}", path))?;
        return Batch::decode(&bytes).with_context(|| format!("解析批次文件失败: {:?}", path));
    }
    BatchFile::load(path)?.to_batch()
}

/// 把批次文件打包为二进制格式
pub fn pack(file: &Path, output: &Path) -> Result<()> {
    let batch = load_batch(file)?;
    let bytes = batch.encode().context("编码批次失败")?;
    fs::write(output, &bytes).with_context(|| format!("写入批次文件失败: {:?}", output))?;

    println!(
        "{} 已打包 {} 个运行 → {:?} ({} 字节)",
        "✓".green().bold(),
        batch.len().to_string().yellow(),
        output,
        bytes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
env:
  host: example.org
ignore_errors: true
runs:
  - mode: sync
    name: 登录
    timeout_ms: 3000
    steps:
      - type: echo
        config: { response: ok }
  - name: 查询
    steps:
      - type: wait
        config: { ms: 1 }
"#;

    #[test]
    fn test_yaml_batch_file() {
        let file = BatchFile::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(file.runs.len(), 2);
        assert_eq!(file.runs[0].mode, TaskMode::Sync);
        assert_eq!(file.runs[1].mode, TaskMode::Async);
        assert_eq!(file.runs[0].definition.timeout_ms, Some(3000));
        assert_eq!(file.options(), OPTION_IGNORE_ERRORS);

        let batch = file.to_batch().unwrap();
        assert_eq!(batch.context.env["host"], "example.org");
        assert_eq!(batch.runs[1].definition().unwrap().name, "查询");
    }

    #[test]
    fn test_pack_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("batch.yaml");
        let packed = dir.path().join("batch.atb");
        fs::write(&source, SAMPLE).unwrap();

        pack(&source, &packed).unwrap();
        let batch = load_batch(&packed).unwrap();
        assert_eq!(batch, load_batch(&source).unwrap());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.txt");
        fs::write(&path, SAMPLE).unwrap();
        assert!(load_batch(&path).is_err());
    }
}
