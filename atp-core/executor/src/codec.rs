//! 运行结果二进制格式
//!
//! ```text
//! 头部 32 字节（大端）:
//!   "ATR" | 协议版本 u8 | 引擎版本 u32 | 状态 u8 | 进度 u8 (0..=255)
//!   | 开始毫秒 u40 | 结束毫秒 u40 | 选项 u32 | 索引长度 u32 | 长度表字节数 u32
//! 索引块: zlib(JSON IndexTree)
//! 长度表: 每个步骤序号一个 u32，0 表示无详情
//! 详情块: 按步骤序号依次拼接的 zlib(JSON)
//! ```

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use atp_common::RunStatus;

use crate::context::DatasetCounters;
use crate::result_tree::IndexTree;
use crate::{ExecutorError, Result};

pub const RESULT_MARKER: &[u8; 3] = b"ATR";
pub const RESULT_PROTOCOL_VERSION: u8 = 1;
pub const RESULT_HEADER_LEN: usize = 32;

const U40_MAX: u64 = (1 << 40) - 1;

/// zlib 压缩 JSON
pub fn compress_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// 解压并解析 JSON
pub fn decompress_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut json = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| ExecutorError::Codec(format!("解压失败: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u40(bytes: &[u8], at: usize) -> u64 {
    bytes[at..at + 5]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn write_u40(out: &mut Vec<u8>, value: u64) {
    let value = value.min(U40_MAX);
    out.extend_from_slice(&value.to_be_bytes()[3..]);
}

/// 进度比例 → 单字节
pub fn progress_to_byte(progress: f64) -> u8 {
    (progress.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// 结果头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResultHeader {
    pub protocol_version: u8,
    pub engine_version: u32,
    pub status: RunStatus,
    pub progress: u8,
    pub started_ms: u64,
    pub ended_ms: u64,
    pub options: u32,
    pub index_len: u32,
    pub table_len: u32,
}

impl RunResultHeader {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(RESULT_MARKER);
        out.push(self.protocol_version);
        out.extend_from_slice(&self.engine_version.to_be_bytes());
        out.push(self.status.code());
        out.push(self.progress);
        write_u40(out, self.started_ms);
        write_u40(out, self.ended_ms);
        out.extend_from_slice(&self.options.to_be_bytes());
        out.extend_from_slice(&self.index_len.to_be_bytes());
        out.extend_from_slice(&self.table_len.to_be_bytes());
    }

    /// 解析头部
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESULT_HEADER_LEN {
            return Err(ExecutorError::Truncated(format!(
                "结果头需要 {} 字节，实际 {} 字节",
                RESULT_HEADER_LEN,
                bytes.len()
            )));
        }
        if &bytes[0..3] != RESULT_MARKER {
            return Err(ExecutorError::InvalidMarker);
        }
        let protocol_version = bytes[3];
        if protocol_version != RESULT_PROTOCOL_VERSION {
            return Err(ExecutorError::UnsupportedVersion(protocol_version));
        }
        let status = RunStatus::from_code(bytes[8])
            .ok_or_else(|| ExecutorError::Codec(format!("未知的运行状态: {}", bytes[8])))?;

        Ok(Self {
            protocol_version,
            engine_version: read_u32(bytes, 4),
            status,
            progress: bytes[9],
            started_ms: read_u40(bytes, 10),
            ended_ms: read_u40(bytes, 15),
            options: read_u32(bytes, 20),
            index_len: read_u32(bytes, 24),
            table_len: read_u32(bytes, 28),
        })
    }

    /// 进度比例
    pub fn progress_fraction(&self) -> f64 {
        f64::from(self.progress) / 255.0
    }

    /// 长度表槽位数
    pub fn slots(&self) -> usize {
        self.table_len as usize / 4
    }
}

/// 编码输入
#[derive(Debug, Clone)]
pub struct RunResultParts<'a> {
    pub engine_version: u32,
    pub status: RunStatus,
    pub progress: f64,
    pub started_ms: u64,
    pub ended_ms: u64,
    pub options: u32,
    pub index: &'a IndexTree,
    pub details: &'a BTreeMap<usize, Value>,
    /// 已分配的步骤序号数
    pub slots: usize,
}

/// 编码运行结果
pub fn encode_run_result(parts: &RunResultParts<'_>) -> Result<Vec<u8>> {
    let index = compress_json(parts.index)?;

    let slots = parts
        .details
        .keys()
        .next_back()
        .map(|max| parts.slots.max(max + 1))
        .unwrap_or(parts.slots);

    let mut table = Vec::with_capacity(slots * 4);
    let mut blobs = Vec::new();
    for step_index in 0..slots {
        let len = match parts.details.get(&step_index) {
            Some(detail) => {
                let blob = compress_json(detail)?;
                let len = blob.len() as u32;
                blobs.extend_from_slice(&blob);
                len
            }
            None => 0,
        };
        table.extend_from_slice(&len.to_be_bytes());
    }

    let header = RunResultHeader {
        protocol_version: RESULT_PROTOCOL_VERSION,
        engine_version: parts.engine_version,
        status: parts.status,
        progress: progress_to_byte(parts.progress),
        started_ms: parts.started_ms,
        ended_ms: parts.ended_ms,
        options: parts.options,
        index_len: u32::try_from(index.len())
            .map_err(|_| ExecutorError::Codec("索引块过大".to_string()))?,
        table_len: u32::try_from(table.len())
            .map_err(|_| ExecutorError::Codec("长度表过大".to_string()))?,
    };

    let mut out = Vec::with_capacity(RESULT_HEADER_LEN + index.len() + table.len() + blobs.len());
    header.write(&mut out);
    out.extend_from_slice(&index);
    out.extend_from_slice(&table);
    out.extend_from_slice(&blobs);
    Ok(out)
}

/// 序列化失败时的最小错误结果
///
/// 只有头部和一个带错误信息的索引块；索引压缩失败时索引长度为 0。
pub fn minimal_error_payload(
    engine_version: u32,
    run_id: &str,
    started_ms: u64,
    ended_ms: u64,
    message: &str,
) -> Vec<u8> {
    let index = IndexTree {
        run_id: run_id.to_string(),
        name: String::new(),
        status: RunStatus::Error,
        errors: vec![message.to_string()],
        dataset: DatasetCounters::default(),
        steps: Vec::new(),
    };
    let index = compress_json(&index).unwrap_or_default();

    let header = RunResultHeader {
        protocol_version: RESULT_PROTOCOL_VERSION,
        engine_version,
        status: RunStatus::Error,
        progress: 0,
        started_ms,
        ended_ms,
        options: 0,
        index_len: index.len() as u32,
        table_len: 0,
    };
    let mut out = Vec::with_capacity(RESULT_HEADER_LEN + index.len());
    header.write(&mut out);
    out.extend_from_slice(&index);
    out
}

/// 解码后的运行结果，详情按需解压
#[derive(Debug, Clone)]
pub struct DecodedRunResult {
    pub header: RunResultHeader,
    pub index: Option<IndexTree>,
    lengths: Vec<u32>,
    offsets: Vec<usize>,
    details: Vec<u8>,
}

impl DecodedRunResult {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = RunResultHeader::read(bytes)?;

        let index_end = RESULT_HEADER_LEN + header.index_len as usize;
        let table_end = index_end + header.table_len as usize;
        if bytes.len() < table_end {
            return Err(ExecutorError::Truncated("索引块或长度表不完整".to_string()));
        }
        if header.table_len % 4 != 0 {
            return Err(ExecutorError::Codec(format!(
                "长度表字节数 {} 不是 4 的倍数",
                header.table_len
            )));
        }

        let index = if header.index_len == 0 {
            None
        } else {
            Some(decompress_json(&bytes[RESULT_HEADER_LEN..index_end])?)
        };

        let lengths: Vec<u32> = (index_end..table_end)
            .step_by(4)
            .map(|at| read_u32(bytes, at))
            .collect();

        let mut offsets = Vec::with_capacity(lengths.len());
        let mut offset = 0usize;
        for len in &lengths {
            offsets.push(offset);
            offset += *len as usize;
        }

        let details = &bytes[table_end..];
        if details.len() < offset {
            return Err(ExecutorError::Truncated(format!(
                "详情块需要 {} 字节，实际 {} 字节",
                offset,
                details.len()
            )));
        }

        Ok(Self {
            header,
            index,
            lengths,
            offsets,
            details: details[..offset].to_vec(),
        })
    }

    /// 长度表槽位数
    pub fn slots(&self) -> usize {
        self.lengths.len()
    }

    /// 按步骤序号读取详情（随机访问）
    pub fn detail(&self, step_index: usize) -> Result<Option<Value>> {
        let Some(&len) = self.lengths.get(step_index) else {
            return Ok(None);
        };
        if len == 0 {
            return Ok(None);
        }
        let start = self.offsets[step_index];
        let blob = &self.details[start..start + len as usize];
        decompress_json(blob).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index(status: RunStatus) -> IndexTree {
        IndexTree {
            run_id: "run-1".to_string(),
            name: "demo".to_string(),
            status,
            errors: Vec::new(),
            dataset: DatasetCounters::default(),
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_header_layout() {
        let index = index(RunStatus::Done);
        let details = BTreeMap::new();
        let bytes = encode_run_result(&RunResultParts {
            engine_version: 0x0102_0304,
            status: RunStatus::Done,
            progress: 1.0,
            started_ms: 0x01_0203_0405,
            ended_ms: 0x01_0203_0406,
            options: 0x3,
            index: &index,
            details: &details,
            slots: 2,
        })
        .unwrap();

        assert_eq!(&bytes[0..3], b"ATR");
        assert_eq!(bytes[3], RESULT_PROTOCOL_VERSION);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 255);
        assert_eq!(&bytes[10..15], &[1, 2, 3, 4, 5]);
        assert_eq!(&bytes[15..20], &[1, 2, 3, 4, 6]);
        assert_eq!(read_u32(&bytes, 20), 3);
        assert_eq!(read_u32(&bytes, 28), 8);
    }

    #[test]
    fn test_random_access_details() {
        let index = index(RunStatus::Error);
        let mut details = BTreeMap::new();
        details.insert(0, json!({"response": "first"}));
        details.insert(3, json!({"response": [1, 2, 3]}));

        let bytes = encode_run_result(&RunResultParts {
            engine_version: 1,
            status: RunStatus::Error,
            progress: 0.5,
            started_ms: 10,
            ended_ms: 20,
            options: 0,
            index: &index,
            details: &details,
            slots: 2,
        })
        .unwrap();

        let decoded = DecodedRunResult::decode(&bytes).unwrap();
        assert_eq!(decoded.header.status, RunStatus::Error);
        assert_eq!(decoded.header.progress, 128);
        assert_eq!(decoded.slots(), 4);
        assert_eq!(decoded.detail(3).unwrap(), Some(json!({"response": [1, 2, 3]})));
        assert_eq!(decoded.detail(0).unwrap(), Some(json!({"response": "first"})));
        assert_eq!(decoded.detail(1).unwrap(), None);
        assert_eq!(decoded.detail(99).unwrap(), None);
        assert_eq!(decoded.index.unwrap().run_id, "run-1");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            DecodedRunResult::decode(b"ATR"),
            Err(ExecutorError::Truncated(_))
        ));

        let mut bytes = minimal_error_payload(1, "r", 0, 0, "boom");
        bytes[0] = b'X';
        assert!(matches!(
            DecodedRunResult::decode(&bytes),
            Err(ExecutorError::InvalidMarker)
        ));

        let mut bytes = minimal_error_payload(1, "r", 0, 0, "boom");
        bytes[3] = 9;
        assert!(matches!(
            DecodedRunResult::decode(&bytes),
            Err(ExecutorError::UnsupportedVersion(9))
        ));

        let bytes = minimal_error_payload(1, "r", 0, 0, "boom");
        assert!(matches!(
            DecodedRunResult::decode(&bytes[..bytes.len() - 1]),
            Err(ExecutorError::Truncated(_))
        ));
    }

    #[test]
    fn test_minimal_error_payload_decodes() {
        let bytes = minimal_error_payload(7, "run-x", 1, 2, "序列化失败");
        let decoded = DecodedRunResult::decode(&bytes).unwrap();
        assert_eq!(decoded.header.engine_version, 7);
        assert_eq!(decoded.header.status, RunStatus::Error);
        assert_eq!(decoded.slots(), 0);
        let index = decoded.index.unwrap();
        assert_eq!(index.errors, vec!["序列化失败".to_string()]);
    }
}
