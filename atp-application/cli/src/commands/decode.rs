//! decode 命令：查看二进制运行结果

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::{json, Value};
use std::path::Path;

use atp_executor::result_tree::IndexChildren;
use atp_executor::{DecodedRunResult, IndexNode};

use super::{run_status_label, step_status_icon};

fn format_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string()
        })
        .unwrap_or_else(|| ms.to_string())
}

fn print_nodes(decoded: &DecodedRunResult, nodes: &[IndexNode], depth: usize, details: bool) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        let mut line = format!(
            "{}{} {} {}",
            indent,
            step_status_icon(node.status),
            node.id.bright_black(),
            node.step_type.cyan()
        );
        if let Some(name) = &node.name {
            line.push_str(&format!(" {}", name));
        }
        line.push_str(&format!(" ({} ms)", node.elapsed_ms));
        if node.bypassed {
            line.push_str(&format!(" {}", "[旁路]".bright_black()));
        }
        if let Some(reason) = &node.skip_reason {
            line.push_str(&format!(" {}", format!("[跳过: {:?}]", reason).yellow()));
        }
        println!("{}", line);

        for error in &node.errors {
            println!("{}   {}", indent, error.red());
        }
        if details {
            if let Some(Ok(Some(detail))) = node.step_index.map(|i| decoded.detail(i)) {
                println!("{}   {}", indent, detail.to_string().bright_black());
            }
        }

        match &node.steps {
            IndexChildren::None => {}
            IndexChildren::Flat(children) => print_nodes(decoded, children, depth + 1, details),
            IndexChildren::Groups(groups) => {
                for (g, group) in groups.iter().enumerate() {
                    println!("{}  [组 {}]", indent, g);
                    print_nodes(decoded, group, depth + 2, details);
                }
            }
        }
    }
}

fn print_table(decoded: &DecodedRunResult, details: bool) {
    let header = &decoded.header;
    println!("{}", "=".repeat(60));
    println!("{}", "运行结果".bold());
    println!("{}", "=".repeat(60));

    if let Some(index) = &decoded.index {
        println!("运行 ID:  {}", index.run_id);
        if !index.name.is_empty() {
            println!("名称:     {}", index.name.cyan().bold());
        }
    }
    println!("状态:     {}", run_status_label(header.status));
    println!("进度:     {:.0}%", header.progress_fraction() * 100.0);
    println!("开始:     {}", format_ms(header.started_ms));
    println!("结束:     {}", format_ms(header.ended_ms));
    println!(
        "耗时:     {} ms",
        header.ended_ms.saturating_sub(header.started_ms).to_string().yellow()
    );
    println!(
        "引擎版本: {}  协议版本: {}  选项: {:#x}  详情槽位: {}",
        header.engine_version,
        header.protocol_version,
        header.options,
        decoded.slots()
    );

    let Some(index) = &decoded.index else {
        println!("\n{}", "结果不包含索引".yellow());
        return;
    };
    for error in &index.errors {
        println!("{} {}", "错误:".red().bold(), error.red());
    }
    if index.dataset.total > 0 {
        println!(
            "数据行:   共 {} 通过 {} 失败 {} 跳过 {}",
            index.dataset.total,
            index.dataset.passed.to_string().green(),
            index.dataset.failed.to_string().red(),
            index.dataset.skipped.to_string().yellow()
        );
    }
    println!();
    print_nodes(decoded, &index.steps, 0, details);
}

fn to_json(decoded: &DecodedRunResult) -> Result<Value> {
    let header = &decoded.header;
    let mut details = serde_json::Map::new();
    for slot in 0..decoded.slots() {
        if let Some(detail) = decoded.detail(slot)? {
            details.insert(slot.to_string(), detail);
        }
    }
    Ok(json!({
        "protocol_version": header.protocol_version,
        "engine_version": header.engine_version,
        "status": header.status,
        "progress": header.progress_fraction(),
        "started_ms": header.started_ms,
        "ended_ms": header.ended_ms,
        "options": header.options,
        "index": decoded.index,
        "details": details,
    }))
}

pub fn handle(file: &Path, format: &str, details: bool) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("读取结果文件失败: {:?}", file))?;
    let decoded = DecodedRunResult::decode(&bytes)
        .with_context(|| format!("解析结果文件失败: {:?}", file))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&to_json(&decoded)?)?),
        "table" => print_table(&decoded, details),
        other => anyhow::bail!("不支持的输出格式: {}，仅支持 table 或 json", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_common::RunStatus;
    use atp_executor::minimal_error_payload;

    #[test]
    fn test_json_view_of_minimal_payload() {
        let payload = minimal_error_payload(3, "run-1", 1_000, 2_000, "boom");
        let decoded = DecodedRunResult::decode(&payload).unwrap();
        let view = to_json(&decoded).unwrap();

        assert_eq!(view["status"], json!(RunStatus::Error));
        assert_eq!(view["engine_version"], 3);
        assert_eq!(view["index"]["errors"][0], "boom");
        assert_eq!(view["details"], json!({}));
    }

    #[test]
    fn test_handle_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.atr");
        std::fs::write(&path, b"nope").unwrap();
        assert!(handle(&path, "table", false).is_err());
    }
}
