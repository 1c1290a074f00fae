use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use pipeline_core::config::RetryConfig;
use pipeline_core::{Clock, PipelineError};
use pipeline_domain::{
    EventPayload, Fetcher, Item, ItemRepository, ItemState, ItemStateMachine, LinkDetector,
    LinkFetcher, NotificationKind, Publisher,
};
use tracing::error;

use crate::concurrency_gate::ConcurrencyGate;
use crate::event_bus::EventPublisher;
use crate::notification::ProgressNotifier;
use crate::retry_service::RetryService;
use crate::tracker::InFlightTracker;
use crate::trigger::StageTrigger;
use crate::worker_pool::WorkerPool;

/// 调度器自身的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Starting => "starting",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// 各阶段处理器共享的依赖
pub struct PipelineContext {
    pub repository: Arc<dyn ItemRepository>,
    pub machine: Arc<ItemStateMachine>,
    pub pool: Arc<WorkerPool>,
    pub gate: ConcurrencyGate,
    pub fetcher: Arc<dyn Fetcher>,
    pub publisher: Arc<dyn Publisher>,
    pub link_fetcher: Option<Arc<dyn LinkFetcher>>,
    pub link_detector: Arc<LinkDetector>,
    pub notifier: Arc<ProgressNotifier>,
    pub retry: RetryService,
    pub events: EventPublisher,
    pub clock: Arc<dyn Clock>,
    pub retry_config: RetryConfig,
    pub default_destination: String,
    pub download_trigger: StageTrigger,
    pub upload_trigger: StageTrigger,
    pub poll_trigger: StageTrigger,
    pub tracker: Arc<InFlightTracker>,
    lifecycle: Mutex<SchedulerState>,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn ItemRepository>,
        pool: Arc<WorkerPool>,
        gate: ConcurrencyGate,
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
        link_fetcher: Option<Arc<dyn LinkFetcher>>,
        link_detector: Arc<LinkDetector>,
        notifier: Arc<ProgressNotifier>,
        events: EventPublisher,
        clock: Arc<dyn Clock>,
        retry_config: RetryConfig,
        default_destination: String,
    ) -> Self {
        let machine = Arc::new(ItemStateMachine::new(
            Arc::clone(&repository),
            Arc::clone(&clock),
        ));
        let retry = RetryService::new(
            Arc::clone(&machine),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            retry_config.clone(),
        );
        Self {
            repository,
            machine,
            pool,
            gate,
            fetcher,
            publisher,
            link_fetcher,
            link_detector,
            notifier,
            retry,
            events,
            clock,
            retry_config,
            default_destination,
            download_trigger: StageTrigger::new("download"),
            upload_trigger: StageTrigger::new("upload"),
            poll_trigger: StageTrigger::new("poll"),
            tracker: InFlightTracker::new(),
            lifecycle: Mutex::new(SchedulerState::Stopped),
        }
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_scheduler_state(&self, state: SchedulerState) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// 唤醒条目当前状态对应的阶段
    pub fn wake_stage_for(&self, item: &Item, state: ItemState) {
        match state {
            ItemState::Discovered => {
                self.events.publish(EventPayload::ItemsDiscovered {
                    source_id: item.source_id.clone(),
                    count: 1,
                });
            }
            ItemState::Downloaded => {
                self.events.publish(EventPayload::DownloadCompleted {
                    item_id: item.id.clone(),
                });
            }
            _ => {}
        }
    }

    /// 存储不可用等致命错误上报到顶层错误通知
    pub async fn escalate(&self, err: &PipelineError) {
        error!("流水线遇到致命错误: {err}");
        metrics::counter!("pipeline_fatal_errors_total").increment(1);
        self.notifier
            .broadcast(NotificationKind::StorageError, format!("存储操作失败: {err}"))
            .await;
    }
}
