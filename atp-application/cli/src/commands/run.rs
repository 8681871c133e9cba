//! run 命令：提交批次并跟踪事件

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use atp_common::{InteractAsk, PromptKind, RunMessage, RunStatus};
use atp_executor::{AdapterRegistry, FileCache};
use atp_scheduler::{BatchHandle, EngineRunner, Scheduler, SchedulerEvent};
use atp_worker_pool::WorkerPool;

use super::batch::load_batch;
use super::run_status_label;
use crate::config::EngineConfig;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// 批次文件 (.yaml/.yml/.json/.atb)
    pub file: PathBuf,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 失败重试次数（覆盖配置）
    #[arg(long)]
    pub retry: Option<u32>,

    /// 最大工作者数量（覆盖配置）
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// 结果输出目录，每个任务写入 task-<序号>.atr
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn build_scheduler(config: &EngineConfig) -> Scheduler {
    let registry = Arc::new(AdapterRegistry::with_builtins());
    let mut runner = EngineRunner::new(registry)
        .with_options(config.run.clone())
        .with_throttle(config.throttle.clone());
    if let Some(dir) = config.cache_dir() {
        debug!("文件缓存目录: {:?}", dir);
        runner = runner.with_file_cache(Arc::new(FileCache::new(dir)));
    }

    let pool = WorkerPool::new(config.pool.clone(), Arc::new(runner));
    Scheduler::new(Arc::new(pool), config.scheduler.clone())
}

/// 从标准输入读取交互应答
fn prompt_answers(task_id: usize, ask: &InteractAsk) -> Result<Vec<String>> {
    let stdin = std::io::stdin();
    let mut answers = Vec::with_capacity(ask.prompts.len());
    for prompt in &ask.prompts {
        let hint = match prompt.kind {
            PromptKind::Confirm => " [y/N]",
            PromptKind::Input => "",
        };
        print!(
            "{} 任务 {} 步骤 {}: {}{} ",
            "?".cyan().bold(),
            task_id,
            ask.step_id,
            prompt.message,
            hint
        );
        std::io::stdout().flush().context("刷新标准输出失败")?;

        let mut line = String::new();
        stdin.lock().read_line(&mut line).context("读取应答失败")?;
        answers.push(line.trim().to_string());
    }
    Ok(answers)
}

fn write_result(dir: &Path, task_id: usize, payload: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("创建输出目录失败: {:?}", dir))?;
    let path = dir.join(format!("task-{}.atr", task_id));
    std::fs::write(&path, payload).with_context(|| format!("写入结果失败: {:?}", path))?;
    Ok(path)
}

fn handle_event(
    event: SchedulerEvent,
    handle: &BatchHandle,
    progress: &ProgressBar,
    output: Option<&Path>,
) -> Result<Option<Vec<RunStatus>>> {
    match event {
        SchedulerEvent::Started {
            task_id,
            attempt,
            worker_id,
        } => {
            progress.set_message(format!("任务 {} → 工作者 #{}", task_id, worker_id));
            if attempt > 0 {
                progress.println(format!(
                    "{} 任务 {} 第 {} 次重试",
                    "↻".yellow(),
                    task_id,
                    attempt
                ));
            }
        }
        SchedulerEvent::Message { task_id, message } => match message {
            RunMessage::Error { message } => {
                progress.println(format!("{} 任务 {}: {}", "!".red().bold(), task_id, message.red()))
            }
            RunMessage::Progress(snapshot) | RunMessage::QueryReply(snapshot) => debug!(
                task_id,
                "进度 {:.0}% ({}/{})",
                snapshot.progress * 100.0,
                snapshot.counters.finished(),
                snapshot.counters.total()
            ),
            RunMessage::StepUpdate { step_id, status } => {
                debug!(task_id, "步骤 {} → {}", step_id, status)
            }
        },
        SchedulerEvent::InteractAsk { task_id, ask } => {
            let answers = tokio::task::block_in_place(|| {
                progress.suspend(|| prompt_answers(task_id, &ask))
            })?;
            handle.interact(task_id, ask.step_index, answers)?;
        }
        SchedulerEvent::SetGlobalVariable {
            task_id,
            name,
            value,
        } => progress.println(format!(
            "  任务 {} 设置全局变量 {} = {}",
            task_id,
            name.cyan(),
            value
        )),
        SchedulerEvent::Exit { task_id, reason } => {
            progress.println(format!("{} 任务 {}: {}", "✗".red().bold(), task_id, reason.red()))
        }
        SchedulerEvent::Retry {
            task_id,
            attempt,
            status,
        } => progress.println(format!(
            "{} 任务 {} 第 {} 次执行结果为 {}，重新排队",
            "↻".yellow(),
            task_id,
            attempt,
            run_status_label(status)
        )),
        SchedulerEvent::Done {
            task_id,
            status,
            attempts,
            payload,
        } => {
            progress.inc(1);
            progress.println(format!(
                "{} 任务 {}: {} (执行 {} 次)",
                if status == RunStatus::Done {
                    "✓".green().bold()
                } else {
                    "✗".red().bold()
                },
                task_id,
                run_status_label(status),
                attempts
            ));
            if let (Some(dir), false) = (output, payload.is_empty()) {
                let path = write_result(dir, task_id, &payload)?;
                info!("任务 {} 的结果已写入 {:?}", task_id, path);
            }
        }
        SchedulerEvent::Summary { statuses } => return Ok(Some(statuses)),
    }
    Ok(None)
}

pub async fn handle(args: RunArgs) -> Result<()> {
    let (mut config, used) = EngineConfig::load(args.config.as_deref())?;
    match &used {
        Some(path) => info!("使用配置文件: {:?}", path),
        None => info!("未找到配置文件，使用默认配置"),
    }
    if let Some(retry) = args.retry {
        config.scheduler.retry_count = retry;
    }
    if let Some(workers) = args.workers {
        config.pool.max_workers = workers;
    }

    let batch = load_batch(&args.file)?;
    let total = batch.len();
    println!(
        "{} 批次加载成功: {} 个运行，最多 {} 个工作者",
        "✓".green().bold(),
        total.to_string().yellow(),
        config.pool.max_workers
    );

    let scheduler = build_scheduler(&config);
    let (handle, events) = scheduler.submit(batch);

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，取消全部任务");
            let _ = interrupt.cancel_all();
        }
    });

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("进度条模板无效")?
            .progress_chars("=>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));

    let mut statuses = Vec::new();
    while let Ok(event) = events.recv().await {
        if let Some(summary) = handle_event(event, &handle, &progress, args.output.as_deref())? {
            statuses = summary;
        }
    }
    progress.finish_and_clear();
    scheduler.pool().shutdown().await;

    println!("\n{}", "=".repeat(60));
    println!("{}", "批次结果".bold());
    println!("{}", "=".repeat(60));
    for (task_id, status) in statuses.iter().enumerate() {
        println!("  任务 {:<4} {}", task_id, run_status_label(*status));
    }
    let failed = statuses
        .iter()
        .filter(|s| !matches!(s, RunStatus::Done | RunStatus::Skip))
        .count();
    println!("{}", "=".repeat(60));

    if failed > 0 {
        anyhow::bail!("{} 个运行未成功", failed);
    }
    println!("{} 全部运行成功", "✓".green().bold());
    Ok(())
}
