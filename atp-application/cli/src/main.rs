//! ATP CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "atp")]
#[command(about = "ATP - 多协议测试执行引擎", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别（设置 RUST_LOG 时以其为准）
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行批次
    Run(commands::run::RunArgs),

    /// 将批次文件打包为二进制格式
    Pack {
        /// 批次文件 (.yaml/.yml/.json)
        file: PathBuf,
        /// 输出文件
        #[arg(short, long)]
        output: PathBuf,
    },

    /// 查看运行结果
    Decode {
        /// 结果文件
        file: PathBuf,
        /// 输出格式 (table/json)
        #[arg(short = 'f', long, default_value = "table")]
        format: String,
        /// 表格中显示步骤详情
        #[arg(long)]
        details: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("ATP CLI 启动");

    match cli.command {
        Commands::Run(args) => commands::run::handle(args).await?,
        Commands::Pack { file, output } => commands::batch::pack(&file, &output)?,
        Commands::Decode {
            file,
            format,
            details,
        } => commands::decode::handle(&file, &format, details)?,
    }

    Ok(())
}
