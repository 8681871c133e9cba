//! CLI 命令处理模块

pub mod batch;
pub mod decode;
pub mod run;

use atp_common::{RunStatus, StepStatus};
use colored::{ColoredString, Colorize};

/// 运行状态的彩色标签
pub fn run_status_label(status: RunStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Done => text.green(),
        RunStatus::Error | RunStatus::Timeout => text.red(),
        RunStatus::Cancel | RunStatus::Skip => text.yellow(),
        RunStatus::Wait | RunStatus::Running => text.bright_black(),
    }
}

/// 步骤状态图标
pub fn step_status_icon(status: StepStatus) -> ColoredString {
    match status {
        StepStatus::Done => "✓".green(),
        StepStatus::Error => "✗".red(),
        StepStatus::Skip => "⊘".yellow(),
        StepStatus::Interact => "?".cyan(),
        StepStatus::Running => "…".blue(),
        StepStatus::Wait => "·".bright_black(),
    }
}
