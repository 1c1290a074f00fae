//! 流水线调度器
//!
//! 负责定时轮询来源、事件消费循环、各阶段的备份扫描、失败重试扫描、
//! 卡住条目扫描、清理和每日统计，并管理自身的启动与优雅停止。

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::config::{RetryConfig, SchedulerConfig, StageConfig};
use pipeline_core::{Clock, PipelineError, PipelineResult, SystemClock};
use pipeline_domain::{
    detect_links, Event, EventPayload, Fetcher, ItemRepository, LinkDetector, LinkFetcher,
    NotificationKind, Notifier, Publisher, SourceLister,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::concurrency_gate::ConcurrencyGate;
use crate::context::{PipelineContext, SchedulerState};
use crate::controller::PipelineController;
use crate::event_bus::{self, EventPublisher, EventReceiver, Received};
use crate::notification::ProgressNotifier;
use crate::recovery_service::RecoveryService;
use crate::stages::{aux, download, upload};
use crate::worker_pool::WorkerPool;

struct RunningTasks {
    shutdown_tx: broadcast::Sender<()>,
    consumer: JoinHandle<()>,
    timers: JoinHandle<()>,
}

pub struct PipelineScheduler {
    ctx: Arc<PipelineContext>,
    source_lister: Arc<dyn SourceLister>,
    recovery: Arc<RecoveryService>,
    controller: Arc<PipelineController>,
    config: SchedulerConfig,
    receiver: Arc<Mutex<EventReceiver>>,
    running: Mutex<Option<RunningTasks>>,
}

impl PipelineScheduler {
    pub fn builder() -> PipelineSchedulerBuilder {
        PipelineSchedulerBuilder::default()
    }

    pub fn state(&self) -> SchedulerState {
        self.ctx.scheduler_state()
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn controller(&self) -> Arc<PipelineController> {
        Arc::clone(&self.controller)
    }

    pub fn recovery(&self) -> Arc<RecoveryService> {
        Arc::clone(&self.recovery)
    }

    pub fn events(&self) -> EventPublisher {
        self.ctx.events.clone()
    }

    /// 启动调度器，重复调用是无操作
    pub async fn start(&self) -> PipelineResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("调度器已在运行");
            return Ok(());
        }

        self.ctx.set_scheduler_state(SchedulerState::Starting);
        info!("启动流水线调度器");

        let (shutdown_tx, _) = broadcast::channel(4);
        self.ctx.set_scheduler_state(SchedulerState::Running);

        let consumer = tokio::spawn(run_event_loop(
            Arc::clone(&self.ctx),
            Arc::clone(&self.receiver),
            Arc::clone(&self.recovery),
            shutdown_tx.subscribe(),
            self.config.event_wait_timeout(),
        ));
        let timers = tokio::spawn(run_timers(
            Arc::clone(&self.ctx),
            Arc::clone(&self.source_lister),
            Arc::clone(&self.recovery),
            self.config.clone(),
            shutdown_tx.subscribe(),
        ));
        *running = Some(RunningTasks {
            shutdown_tx,
            consumer,
            timers,
        });

        // 进程重启后继续处理遗留的条目
        spawn_download_drain(&self.ctx);
        spawn_upload_drain(&self.ctx);

        self.ctx
            .notifier
            .broadcast(NotificationKind::Lifecycle, "流水线调度器已启动")
            .await;
        info!("流水线调度器已启动");
        Ok(())
    }

    /// 停止调度器：取消消费循环和定时器，等待进行中的处理任务结束。重复调用是无操作
    pub async fn stop(&self) -> PipelineResult<()> {
        let mut running = self.running.lock().await;
        let Some(tasks) = running.take() else {
            debug!("调度器未运行");
            return Ok(());
        };

        self.ctx.set_scheduler_state(SchedulerState::Stopping);
        info!("停止流水线调度器");
        let _ = tasks.shutdown_tx.send(());

        if let Err(e) = tasks.timers.await {
            error!("定时任务退出异常: {e}");
        }
        if let Err(e) = tasks.consumer.await {
            error!("事件消费循环退出异常: {e}");
        }

        let in_flight = self.ctx.tracker.in_flight();
        if in_flight > 0 {
            info!("等待 {in_flight} 个进行中的处理任务结束");
        }
        if !self
            .ctx
            .tracker
            .wait_idle_timeout(self.config.shutdown_timeout())
            .await
        {
            warn!(
                remaining = self.ctx.tracker.in_flight(),
                "等待处理任务结束超时"
            );
        }

        self.ctx.set_scheduler_state(SchedulerState::Stopped);
        self.ctx
            .notifier
            .broadcast(NotificationKind::Lifecycle, "流水线调度器已停止")
            .await;
        info!("流水线调度器已停止");
        Ok(())
    }

    /// 立即轮询所有来源
    pub async fn poll_sources(&self) -> PipelineResult<usize> {
        poll_sources(&self.ctx, self.source_lister.as_ref(), &self.config).await
    }

    /// 执行一轮下载，阶段已在排空时返回 false
    pub async fn run_download_pass(&self) -> bool {
        download::drain_downloads(Arc::clone(&self.ctx)).await
    }

    pub async fn run_upload_pass(&self) -> bool {
        upload::drain_uploads(Arc::clone(&self.ctx)).await
    }

    /// 等待所有已派发的处理任务结束
    pub async fn wait_idle(&self) {
        self.ctx.tracker.wait_idle().await;
    }
}

fn spawn_download_drain(ctx: &Arc<PipelineContext>) {
    if ctx.download_trigger.is_draining() {
        debug!("下载阶段正在处理中，忽略本次触发");
        return;
    }
    let ctx_clone = Arc::clone(ctx);
    ctx.tracker.spawn(async move {
        download::drain_downloads(ctx_clone).await;
    });
}

fn spawn_upload_drain(ctx: &Arc<PipelineContext>) {
    if ctx.upload_trigger.is_draining() {
        debug!("上传阶段正在处理中，忽略本次触发");
        return;
    }
    let ctx_clone = Arc::clone(ctx);
    ctx.tracker.spawn(async move {
        upload::drain_uploads(ctx_clone).await;
    });
}

fn dispatch(ctx: &Arc<PipelineContext>, recovery: &Arc<RecoveryService>, event: Event) {
    metrics::counter!("events_dispatched_total", "kind" => event.event_type()).increment(1);
    debug!(event_type = event.event_type(), event_id = %event.id, "分发事件");

    match event.payload {
        EventPayload::ItemsDiscovered { .. } => spawn_download_drain(ctx),
        EventPayload::DownloadCompleted { .. } => spawn_upload_drain(ctx),
        EventPayload::UploadCompleted { .. } => {
            let recovery = Arc::clone(recovery);
            let ctx_clone = Arc::clone(ctx);
            ctx.tracker.spawn(async move {
                if let Err(e) = recovery.check_pending_work().await {
                    ctx_clone.escalate(&e).await;
                }
            });
        }
        EventPayload::AuxDownloadNeeded { item_id } => {
            ctx.tracker.spawn(aux::fetch_links(Arc::clone(ctx), item_id));
        }
        EventPayload::AuxDownloadCompleted {
            item_id,
            fetched,
            failed,
        } => {
            debug!(item_id, fetched, failed, "附件下载事件已处理");
        }
    }
}

async fn run_event_loop(
    ctx: Arc<PipelineContext>,
    receiver: Arc<Mutex<EventReceiver>>,
    recovery: Arc<RecoveryService>,
    mut shutdown_rx: broadcast::Receiver<()>,
    wait: Duration,
) {
    let mut receiver = receiver.lock().await;
    info!("事件消费循环已启动");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("事件消费循环收到关闭信号");
                break;
            }
            received = receiver.next(wait) => match received {
                Received::Event(event) => {
                    if ctx.scheduler_state() == SchedulerState::Running {
                        dispatch(&ctx, &recovery, event);
                    }
                }
                Received::Timeout => debug!("事件队列空闲"),
                Received::Closed => {
                    warn!("事件总线已关闭");
                    break;
                }
            }
        }
    }

    let remaining = receiver.drain();
    if !remaining.is_empty() {
        info!("停止过程中排出 {} 个未分发的事件", remaining.len());
    }
}

fn sweep_interval(seconds: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(seconds);
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn run_timers(
    ctx: Arc<PipelineContext>,
    source_lister: Arc<dyn SourceLister>,
    recovery: Arc<RecoveryService>,
    config: SchedulerConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut poll = interval(Duration::from_secs(config.poll_interval_seconds));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut download_sweep = sweep_interval(config.download_sweep_interval_seconds);
    let mut upload_sweep = sweep_interval(config.upload_sweep_interval_seconds);
    let mut retry_sweep = sweep_interval(config.retry_sweep_interval_seconds);
    let mut stuck_sweep = sweep_interval(config.stuck_sweep_interval_seconds);
    let mut cleanup = sweep_interval(config.cleanup_interval_seconds);
    let mut daily_summary = sweep_interval(config.daily_summary_interval_seconds);

    info!("定时任务已启动");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("定时任务收到关闭信号");
                break;
            }
            _ = poll.tick() => {
                let ctx_clone = Arc::clone(&ctx);
                let lister = Arc::clone(&source_lister);
                let config = config.clone();
                ctx.tracker.spawn(async move {
                    if let Err(e) = poll_sources(&ctx_clone, lister.as_ref(), &config).await {
                        ctx_clone.escalate(&e).await;
                    }
                });
            }
            _ = download_sweep.tick() => {
                debug!("下载阶段备份扫描");
                spawn_download_drain(&ctx);
            }
            _ = upload_sweep.tick() => {
                debug!("上传阶段备份扫描");
                spawn_upload_drain(&ctx);
            }
            _ = retry_sweep.tick() => {
                let ctx_clone = Arc::clone(&ctx);
                let recovery = Arc::clone(&recovery);
                ctx.tracker.spawn(async move {
                    if let Err(e) = recovery.retry_stale_failed().await {
                        ctx_clone.escalate(&e).await;
                    }
                });
            }
            _ = stuck_sweep.tick() => {
                let ctx_clone = Arc::clone(&ctx);
                let recovery = Arc::clone(&recovery);
                ctx.tracker.spawn(async move {
                    if let Err(e) = recovery.recover_stuck().await {
                        ctx_clone.escalate(&e).await;
                    }
                });
            }
            _ = cleanup.tick() => {
                let ctx_clone = Arc::clone(&ctx);
                let recovery = Arc::clone(&recovery);
                ctx.tracker.spawn(async move {
                    if let Err(e) = recovery.cleanup_abandoned().await {
                        ctx_clone.escalate(&e).await;
                    }
                });
            }
            _ = daily_summary.tick() => {
                let ctx_clone = Arc::clone(&ctx);
                let recovery = Arc::clone(&recovery);
                ctx.tracker.spawn(async move {
                    if let Err(e) = recovery.send_daily_summary().await {
                        ctx_clone.escalate(&e).await;
                    }
                });
            }
        }
    }
}

/// 轮询所有来源，记录新条目并发出发现事件，返回新条目数
async fn poll_sources(
    ctx: &Arc<PipelineContext>,
    source_lister: &dyn SourceLister,
    config: &SchedulerConfig,
) -> PipelineResult<usize> {
    let Some(_guard) = ctx.poll_trigger.try_begin() else {
        debug!("来源轮询正在进行中，忽略本次触发");
        return Ok(0);
    };

    info!("开始轮询内容来源");
    let mut total = 0;
    for (index, source_id) in source_lister.sources().iter().enumerate() {
        if index > 0 {
            ctx.clock
                .sleep(Duration::from_millis(config.source_poll_delay_ms))
                .await;
        }

        let since = ctx.repository.last_polled_at(source_id).await?;
        let polled_at = ctx.clock.now();
        let drafts = match source_lister.list_new_items(source_id, since).await {
            Ok(drafts) => drafts,
            Err(e) => {
                warn!(source_id = %source_id, "列举来源失败: {e}");
                continue;
            }
        };

        let mut discovered = 0;
        for draft in &drafts {
            if ctx.repository.insert_if_absent(draft, polled_at).await? {
                discovered += 1;
            }
        }
        ctx.repository.record_poll(source_id, polled_at).await?;

        if discovered > 0 {
            metrics::counter!("items_discovered_total").increment(discovered as u64);
            info!(source_id = %source_id, count = discovered, "发现新条目");
            ctx.events.publish(EventPayload::ItemsDiscovered {
                source_id: source_id.clone(),
                count: discovered,
            });
        } else {
            debug!(source_id = %source_id, "没有新条目");
        }
        total += discovered;
    }
    Ok(total)
}

/// 调度器构建器，所有协作方在构建时注入
pub struct PipelineSchedulerBuilder {
    scheduler_config: SchedulerConfig,
    retry_config: RetryConfig,
    stage_config: StageConfig,
    default_destination: String,
    repository: Option<Arc<dyn ItemRepository>>,
    pool: Option<Arc<WorkerPool>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    publisher: Option<Arc<dyn Publisher>>,
    source_lister: Option<Arc<dyn SourceLister>>,
    link_fetcher: Option<Arc<dyn LinkFetcher>>,
    link_detector: Arc<LinkDetector>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
}

impl Default for PipelineSchedulerBuilder {
    fn default() -> Self {
        Self {
            scheduler_config: SchedulerConfig::default(),
            retry_config: RetryConfig::default(),
            stage_config: StageConfig::default(),
            default_destination: "inbox".to_string(),
            repository: None,
            pool: None,
            fetcher: None,
            publisher: None,
            source_lister: None,
            link_fetcher: None,
            link_detector: Arc::new(detect_links),
            notifier: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl PipelineSchedulerBuilder {
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn stage_config(mut self, config: StageConfig) -> Self {
        self.stage_config = config;
        self
    }

    pub fn default_destination(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = destination.into();
        self
    }

    pub fn repository(mut self, repository: Arc<dyn ItemRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn source_lister(mut self, source_lister: Arc<dyn SourceLister>) -> Self {
        self.source_lister = Some(source_lister);
        self
    }

    pub fn link_fetcher(mut self, link_fetcher: Arc<dyn LinkFetcher>) -> Self {
        self.link_fetcher = Some(link_fetcher);
        self
    }

    pub fn link_detector(mut self, link_detector: Arc<LinkDetector>) -> Self {
        self.link_detector = link_detector;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> PipelineResult<PipelineScheduler> {
        fn required<T>(value: Option<T>, name: &str) -> PipelineResult<T> {
            value.ok_or_else(|| PipelineError::Configuration(format!("缺少 {name}")))
        }

        let repository = required(self.repository, "repository")?;
        let pool = required(self.pool, "worker_pool")?;
        let fetcher = required(self.fetcher, "fetcher")?;
        let publisher = required(self.publisher, "publisher")?;
        let source_lister = required(self.source_lister, "source_lister")?;
        let notifier = required(self.notifier, "notifier")?;

        let (events, receiver) = event_bus::channel(Arc::clone(&self.clock));
        let ctx = Arc::new(PipelineContext::new(
            repository,
            pool,
            ConcurrencyGate::new(&self.stage_config),
            fetcher,
            publisher,
            self.link_fetcher,
            self.link_detector,
            Arc::new(ProgressNotifier::new(notifier)),
            events,
            self.clock,
            self.retry_config,
            self.default_destination,
        ));
        let recovery = Arc::new(RecoveryService::new(
            Arc::clone(&ctx),
            Duration::from_secs(self.scheduler_config.stuck_threshold_seconds),
        ));
        let controller = Arc::new(PipelineController::new(Arc::clone(&ctx)));

        Ok(PipelineScheduler {
            ctx,
            source_lister,
            recovery,
            controller,
            config: self.scheduler_config,
            receiver: Arc::new(Mutex::new(receiver)),
            running: Mutex::new(None),
        })
    }
}
