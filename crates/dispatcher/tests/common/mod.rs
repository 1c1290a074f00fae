#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pipeline_core::config::{RetryConfig, StageConfig, WorkerPoolConfig};
use pipeline_core::{Clock, ManualClock};
use pipeline_dispatcher::event_bus::{self, EventReceiver};
use pipeline_dispatcher::{ConcurrencyGate, PipelineContext, ProgressNotifier, WorkerPool};
use pipeline_domain::{
    detect_links, EventPayload, FetchOutcome, Fetcher, Item, ItemDraft, ItemRepository,
    ItemState, Link, LinkDetector, LinkFetcher, Publisher, SourceLister, StageError,
    WorkerIdentity,
};
use pipeline_infrastructure::{InMemoryItemRepository, RecordingNotifier};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

pub fn draft(id: &str) -> ItemDraft {
    ItemDraft {
        id: id.to_string(),
        source_id: "channel-a".to_string(),
        title: Some(format!("视频 {id}")),
        url: format!("https://example.com/watch/{id}"),
        description: None,
        destination: None,
    }
}

/// 按条目脚本化的下载器，脚本用完后总是成功
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<FetchOutcome, StageError>>>>,
    calls: Mutex<Vec<(String, String)>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
    discarded: Mutex<Vec<String>>,
    refreshed: Mutex<Vec<String>>,
    hold: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次下载占用一段真实时间，便于制造并发重叠
    pub fn holding(hold: Duration) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    pub fn script(&self, item_id: &str, results: Vec<Result<FetchOutcome, StageError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(item_id.to_string(), results.into());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, item_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == item_id).count()
    }

    pub fn max_active(&self, item_id: &str) -> usize {
        self.max_active
            .lock()
            .unwrap()
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().unwrap().clone()
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().unwrap().clone()
    }

    pub fn local_ref(item_id: &str) -> String {
        format!("/data/downloads/{item_id}.mp4")
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, item: &Item, identity: &WorkerIdentity) -> Result<FetchOutcome, StageError> {
        self.calls
            .lock()
            .unwrap()
            .push((item.id.clone(), identity.name.clone()));
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(item.id.clone()).or_default();
            *count += 1;
            let mut max_active = self.max_active.lock().unwrap();
            let max = max_active.entry(item.id.clone()).or_default();
            *max = (*max).max(*count);
        }

        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        } else {
            tokio::task::yield_now().await;
        }

        let result = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(FetchOutcome::Fetched(Self::local_ref(&item.id))));

        *self.active.lock().unwrap().get_mut(&item.id).unwrap() -= 1;
        result
    }

    async fn discard(&self, local_ref: &str) -> Result<(), StageError> {
        self.discarded.lock().unwrap().push(local_ref.to_string());
        Ok(())
    }

    async fn refresh_session(&self, identity: &WorkerIdentity) -> Result<(), StageError> {
        self.refreshed.lock().unwrap().push(identity.name.clone());
        Ok(())
    }
}

/// 脚本化的上传器，脚本用完后总是成功
#[derive(Default)]
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<String, StageError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, results: Vec<Result<String, StageError>>) {
        *self.script.lock().unwrap() = results.into();
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(&self, local_ref: &str, destination: &str) -> Result<String, StageError> {
        self.calls
            .lock()
            .unwrap()
            .push((local_ref.to_string(), destination.to_string()));
        tokio::task::yield_now().await;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("remote:{destination}/{local_ref}")))
    }
}

/// 固定来源列表
#[derive(Default)]
pub struct StaticLister {
    items: Mutex<HashMap<String, Vec<ItemDraft>>>,
    since: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl StaticLister {
    pub fn new(source_id: &str, drafts: Vec<ItemDraft>) -> Self {
        let lister = Self::default();
        lister
            .items
            .lock()
            .unwrap()
            .insert(source_id.to_string(), drafts);
        lister
    }

    pub fn since_values(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.since.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceLister for StaticLister {
    fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.items.lock().unwrap().keys().cloned().collect();
        sources.sort();
        sources
    }

    async fn list_new_items(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemDraft>, StageError> {
        self.since
            .lock()
            .unwrap()
            .push((source_id.to_string(), since));
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 记录附件下载请求的链接下载器
#[derive(Default)]
pub struct RecordingLinkFetcher {
    fetched: Mutex<Vec<String>>,
}

impl RecordingLinkFetcher {
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkFetcher for RecordingLinkFetcher {
    async fn fetch_link(&self, item: &Item, link: &Link) -> Result<String, StageError> {
        self.fetched.lock().unwrap().push(link.file_id.clone());
        Ok(format!("/data/aux/{}_{}", item.id, link.file_id))
    }
}

pub fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        jitter_min: 1.0,
        jitter_max: 1.0,
        ..Default::default()
    }
}

/// 直接组装阶段处理器的测试环境
pub struct Harness {
    pub ctx: Arc<PipelineContext>,
    pub receiver: EventReceiver,
    pub repo: Arc<InMemoryItemRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: ManualClock,
    pub fetcher: Arc<ScriptedFetcher>,
    pub publisher: Arc<ScriptedPublisher>,
    pub pool: Arc<WorkerPool>,
}

pub struct HarnessBuilder {
    identities: Vec<WorkerIdentity>,
    fetcher: ScriptedFetcher,
    publisher: Option<Arc<dyn Publisher>>,
    link_fetcher: Option<Arc<dyn LinkFetcher>>,
    stages: StageConfig,
    retry: RetryConfig,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            identities: vec![
                WorkerIdentity::new("alpha", None),
                WorkerIdentity::new("beta", None),
            ],
            fetcher: ScriptedFetcher::new(),
            publisher: None,
            link_fetcher: None,
            stages: StageConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn identities(mut self, identities: Vec<WorkerIdentity>) -> Self {
        self.identities = identities;
        self
    }

    pub fn fetcher(mut self, fetcher: ScriptedFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn link_fetcher(mut self, link_fetcher: Arc<dyn LinkFetcher>) -> Self {
        self.link_fetcher = Some(link_fetcher);
        self
    }

    pub fn stages(mut self, stages: StageConfig) -> Self {
        self.stages = stages;
        self
    }

    pub fn build(self) -> Harness {
        let clock = ManualClock::new(start_time());
        let repo = Arc::new(InMemoryItemRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let fetcher = Arc::new(self.fetcher);
        let scripted_publisher = Arc::new(ScriptedPublisher::new());
        let publisher: Arc<dyn Publisher> = match self.publisher {
            Some(publisher) => publisher,
            None => scripted_publisher.clone() as Arc<dyn Publisher>,
        };
        let pool = Arc::new(WorkerPool::new(
            self.identities,
            pool_config(),
            Arc::new(clock.clone()),
        ));
        let detector: Arc<LinkDetector> = Arc::new(detect_links);
        let (events, receiver) = event_bus::channel(Arc::new(clock.clone()));

        let ctx = Arc::new(PipelineContext::new(
            repo.clone(),
            pool.clone(),
            ConcurrencyGate::new(&self.stages),
            fetcher.clone(),
            publisher,
            self.link_fetcher,
            detector,
            Arc::new(ProgressNotifier::new(notifier.clone())),
            events,
            Arc::new(clock.clone()),
            self.retry,
            "inbox".to_string(),
        ));

        Harness {
            ctx,
            receiver,
            repo,
            notifier,
            clock,
            fetcher,
            publisher: scripted_publisher,
            pool,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn discover(&self, id: &str) {
        self.discover_draft(draft(id)).await;
    }

    pub async fn discover_draft(&self, draft: ItemDraft) {
        assert!(self
            .repo
            .insert_if_absent(&draft, self.clock.now())
            .await
            .unwrap());
    }

    pub async fn item(&self, id: &str) -> Item {
        self.repo.get(id).await.unwrap().unwrap()
    }

    pub async fn state(&self, id: &str) -> ItemState {
        self.item(id).await.state
    }

    /// 取出目前为止发布的全部事件
    pub fn events(&mut self) -> Vec<EventPayload> {
        self.receiver
            .drain()
            .into_iter()
            .map(|event| event.payload)
            .collect()
    }
}
