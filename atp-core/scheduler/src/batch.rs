//! 批次二进制格式
//!
//! ```text
//! 头 (12 字节): "ATB" | 版本 u8 | 选项 u32 | 上下文长度 u32
//! 上下文: zlib(JSON SharedContext)
//! 重复: 运行长度 u32 | 模式 u32 | zlib(JSON RunDefinition)
//! ```
//!
//! 整数均为大端序。运行定义保持压缩形态，直到在工作者内解码。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use atp_common::TaskMode;
use atp_executor::{compress_json, decompress_json, RunDefinition};

use crate::{Result, SchedulerError};

/// 批次标记
pub const BATCH_MARKER: &[u8; 3] = b"ATB";
/// 批次格式版本
pub const BATCH_PROTOCOL_VERSION: u8 = 1;
/// 批次头长度
pub const BATCH_HEADER_LEN: usize = 12;
const BLOCK_HEADER_LEN: usize = 8;

/// 批次内所有运行共享的上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    /// 环境级变量
    #[serde(default)]
    pub env: Map<String, Value>,

    /// 选项位
    #[serde(default)]
    pub options: u32,
}

/// 批次中的一个运行
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub mode: TaskMode,
    /// 压缩后的运行定义
    pub payload: Vec<u8>,
}

impl BatchRun {
    pub fn from_definition(mode: TaskMode, definition: &RunDefinition) -> Result<Self> {
        Ok(Self {
            mode,
            payload: compress_json(definition)?,
        })
    }

    /// 解码运行定义
    pub fn definition(&self) -> Result<RunDefinition> {
        Ok(decompress_json(&self.payload)?)
    }
}

/// 一个批次
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub context: SharedContext,
    pub runs: Vec<BatchRun>,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl Batch {
    pub fn new(env: Map<String, Value>, options: u32) -> Self {
        Self {
            context: SharedContext { env, options },
            runs: Vec::new(),
        }
    }

    /// 追加一个运行
    pub fn push(&mut self, mode: TaskMode, definition: &RunDefinition) -> Result<()> {
        self.runs.push(BatchRun::from_definition(mode, definition)?);
        Ok(())
    }

    pub fn options(&self) -> u32 {
        self.context.options
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// 编码为二进制
    pub fn encode(&self) -> Result<Vec<u8>> {
        let context = compress_json(&self.context)?;

        let body: usize = self
            .runs
            .iter()
            .map(|r| BLOCK_HEADER_LEN + r.payload.len())
            .sum();
        let mut out = Vec::with_capacity(BATCH_HEADER_LEN + context.len() + body);
        out.extend_from_slice(BATCH_MARKER);
        out.push(BATCH_PROTOCOL_VERSION);
        out.extend_from_slice(&self.context.options.to_be_bytes());
        out.extend_from_slice(&(context.len() as u32).to_be_bytes());
        out.extend_from_slice(&context);

        for run in &self.runs {
            out.extend_from_slice(&(run.payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&run.mode.bits().to_be_bytes());
            out.extend_from_slice(&run.payload);
        }
        Ok(out)
    }

    /// 从二进制解码；运行定义不在此处解压
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BATCH_HEADER_LEN {
            return Err(SchedulerError::Truncated(format!(
                "批次头需要 {} 字节，实际 {} 字节",
                BATCH_HEADER_LEN,
                bytes.len()
            )));
        }
        if &bytes[..3] != BATCH_MARKER {
            return Err(SchedulerError::InvalidMarker);
        }
        if bytes[3] != BATCH_PROTOCOL_VERSION {
            return Err(SchedulerError::UnsupportedVersion(bytes[3]));
        }
        let options = read_u32(bytes, 4);
        let ctx_len = read_u32(bytes, 8) as usize;

        let mut at = BATCH_HEADER_LEN;
        let ctx_end = at
            .checked_add(ctx_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| SchedulerError::Truncated("共享上下文".to_string()))?;
        let mut context: SharedContext = if ctx_len == 0 {
            SharedContext::default()
        } else {
            decompress_json(&bytes[at..ctx_end])?
        };
        // 头部选项位为准
        context.options = options;
        at = ctx_end;

        let mut runs = Vec::new();
        while at < bytes.len() {
            if bytes.len() - at < BLOCK_HEADER_LEN {
                return Err(SchedulerError::Truncated(format!("运行 {} 的块头", runs.len())));
            }
            let run_len = read_u32(bytes, at) as usize;
            let mode_bits = read_u32(bytes, at + 4);
            let mode =
                TaskMode::from_bits(mode_bits).ok_or(SchedulerError::InvalidMode(mode_bits))?;
            at += BLOCK_HEADER_LEN;

            let end = at
                .checked_add(run_len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| SchedulerError::Truncated(format!("运行 {} 的定义", runs.len())))?;
            runs.push(BatchRun {
                mode,
                payload: bytes[at..end].to_vec(),
            });
            at = end;
        }

        Ok(Self { context, runs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_executor::StepDefinition;
    use serde_json::json;

    fn sample() -> Batch {
        let mut env = Map::new();
        env.insert("host".to_string(), json!("10.0.0.1"));
        let mut batch = Batch::new(env, 0x1);

        let mut first = RunDefinition {
            name: "login".to_string(),
            timeout_ms: Some(5_000),
            variables: Map::new(),
            steps: vec![StepDefinition::new("echo")],
        };
        batch.push(TaskMode::Sync, &first).unwrap();
        first.name = "logout".to_string();
        batch.push(TaskMode::Async, &first).unwrap();
        batch
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[..3], b"ATB");
        assert_eq!(bytes[3], 1);
        assert_eq!(read_u32(&bytes, 4), 0x1);

        let ctx_len = read_u32(&bytes, 8) as usize;
        let block = BATCH_HEADER_LEN + ctx_len;
        assert_eq!(read_u32(&bytes, block + 4), TaskMode::SYNC_BIT);
    }

    #[test]
    fn test_decode_keeps_runs_in_order() {
        let batch = sample();
        let decoded = Batch::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.context.env["host"], "10.0.0.1");
        assert_eq!(decoded.runs[0].mode, TaskMode::Sync);
        assert_eq!(decoded.runs[1].definition().unwrap().name, "logout");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            Batch::decode(b"ATB"),
            Err(SchedulerError::Truncated(_))
        ));

        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Batch::decode(&bytes), Err(SchedulerError::InvalidMarker)));

        let mut bytes = sample().encode().unwrap();
        bytes[3] = 9;
        assert!(matches!(
            Batch::decode(&bytes),
            Err(SchedulerError::UnsupportedVersion(9))
        ));

        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Batch::decode(&bytes[..bytes.len() - 1]),
            Err(SchedulerError::Truncated(_))
        ));

        let mut bytes = sample().encode().unwrap();
        let ctx_len = read_u32(&bytes, 8) as usize;
        let mode_at = BATCH_HEADER_LEN + ctx_len + 4;
        bytes[mode_at..mode_at + 4].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            Batch::decode(&bytes),
            Err(SchedulerError::InvalidMode(0))
        ));
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::new(Map::new(), 0);
        let decoded = Batch::decode(&batch.encode().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }
}
