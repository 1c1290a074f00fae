use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline_core::config::IdentityConfig;
use pipeline_core::{AppConfig, SystemClock};
use pipeline_dispatcher::{PipelineController, PipelineScheduler, WorkerPool};
use pipeline_domain::{IdentityRepository, Notifier, WorkerIdentity};
use pipeline_infrastructure::{DatabaseManager, TracingNotifier, WebhookNotifier};
use pipeline_worker::{CommandFetcher, FeedSourceLister, HttpLinkFetcher, HttpPublisher};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 来源列举请求的超时
const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// 主应用程序：组装存储、外部协作方和调度器
pub struct Application {
    database: DatabaseManager,
    scheduler: PipelineScheduler,
    metrics_bind_address: Option<String>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("初始化数据库结构失败")?;

        let items = database.item_repository();
        let identity_repository = database.identity_repository();
        let persisted = identity_repository
            .list_identities()
            .await
            .context("读取工作身份失败")?;
        let identities = merge_identities(&config.identities, persisted);
        if identities.is_empty() {
            warn!("没有配置任何工作身份，下载阶段将无法执行");
        }

        let clock = Arc::new(SystemClock);
        let pool = Arc::new(
            WorkerPool::new(identities, config.worker_pool.clone(), clock.clone())
                .with_repository(identity_repository),
        );

        let fetcher = Arc::new(CommandFetcher::new(config.fetcher.clone()));
        let publisher = Arc::new(HttpPublisher::new(config.publisher.clone())?);
        let source_lister = Arc::new(FeedSourceLister::new(config.sources.clone(), FEED_TIMEOUT)?);
        let link_fetcher = Arc::new(HttpLinkFetcher::new(
            config.fetcher.output_dir.clone(),
            Duration::from_secs(config.fetcher.timeout_seconds),
        )?);
        let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_config(&config.notifier)? {
            Some(webhook) => Arc::new(webhook),
            None => Arc::new(TracingNotifier),
        };

        let scheduler = PipelineScheduler::builder()
            .scheduler_config(config.scheduler.clone())
            .retry_config(config.retry.clone())
            .stage_config(config.stages.clone())
            .default_destination(config.publisher.default_destination.clone())
            .repository(items)
            .worker_pool(pool)
            .fetcher(fetcher)
            .publisher(publisher)
            .source_lister(source_lister)
            .link_fetcher(link_fetcher)
            .notifier(notifier)
            .clock(clock)
            .build()?;

        Ok(Self {
            database,
            scheduler,
            metrics_bind_address: config.observability.metrics_bind_address,
        })
    }

    pub fn controller(&self) -> Arc<PipelineController> {
        self.scheduler.controller()
    }

    /// 运行调度器直到收到关闭信号。指标导出器只在这里安装，管理命令不占用监听地址
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if let Some(address) = &self.metrics_bind_address {
            install_metrics_exporter(address)?;
        }
        self.scheduler.start().await?;

        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，停止调度器");

        self.scheduler.stop().await?;
        self.close().await;
        Ok(())
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}

/// 以配置为准确定身份列表，沿用已持久化的健康状态和启用状态，凭据总是取配置中的值
fn merge_identities(
    configured: &[IdentityConfig],
    persisted: Vec<WorkerIdentity>,
) -> Vec<WorkerIdentity> {
    let mut persisted: HashMap<String, WorkerIdentity> = persisted
        .into_iter()
        .map(|identity| (identity.name.clone(), identity))
        .collect();

    configured
        .iter()
        .map(|entry| match persisted.remove(&entry.name) {
            Some(mut identity) => {
                identity.credentials = entry.credentials.clone();
                identity
            }
            None => {
                let mut identity = WorkerIdentity::new(entry.name.clone(), entry.credentials.clone());
                identity.is_enabled = entry.enabled;
                identity
            }
        })
        .collect()
}

fn install_metrics_exporter(address: &str) -> Result<()> {
    let address: std::net::SocketAddr = address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {e}"))?;
    info!(%address, "Prometheus指标导出器已启动");
    Ok(())
}
