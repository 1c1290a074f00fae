use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use pipeline::{Application, ShutdownManager};
use pipeline_core::AppConfig;
use pipeline_domain::StatusProvider;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 事件驱动的内容采集流水线
#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(version = "1.0.0")]
#[command(about = "事件驱动的内容采集流水线调度器")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 配置文件路径，不指定时按默认位置查找
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行调度器直到收到关闭信号
    Run,
    /// 输出各状态的条目数和工作身份健康状况
    Status,
    /// 手动重试条目
    Retry {
        /// 条目ID
        id: String,
    },
    /// 启用或禁用工作身份
    #[command(group(ArgGroup::new("toggle").required(true).args(["enable", "disable"])))]
    Identity {
        /// 身份名称
        name: String,
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    let log_format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    let shutdown_timeout = Duration::from_secs(config.scheduler.shutdown_timeout_seconds + 5);
    let app = Application::new(config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(app, shutdown_timeout).await,
        Commands::Status => {
            let status = app.controller().get_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            app.close().await;
            Ok(())
        }
        Commands::Retry { id } => {
            let result = app.controller().retry_item(&id).await;
            app.close().await;
            result.with_context(|| format!("重试条目失败: {id}"))?;
            println!("条目 {id} 已重新入队");
            Ok(())
        }
        Commands::Identity { name, enable, .. } => {
            let result = app
                .controller()
                .set_worker_identity_enabled(&name, enable)
                .await;
            app.close().await;
            result.with_context(|| format!("更新工作身份失败: {name}"))?;
            println!("工作身份 {name} 已{}", if enable { "启用" } else { "禁用" });
            Ok(())
        }
    }
}

async fn run(app: Application, shutdown_timeout: Duration) -> Result<()> {
    info!("启动内容采集流水线");
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(shutdown_timeout, app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("安装Ctrl+C信号处理器失败")?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => info!("收到SIGTERM信号"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }
    Ok(())
}
