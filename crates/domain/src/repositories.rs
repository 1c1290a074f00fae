use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::PipelineResult;

use crate::entities::{Item, ItemDraft, ItemState, ItemUpdate, StateCounts, WorkerIdentity};

/// 条目仓储
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// 新条目以 Discovered 状态写入；已存在的ID返回 false
    async fn insert_if_absent(&self, draft: &ItemDraft, now: DateTime<Utc>) -> PipelineResult<bool>;

    async fn get(&self, id: &str) -> PipelineResult<Option<Item>>;

    /// 比较并交换：仅当持久化状态等于 `expected` 时写入新状态和字段，返回是否生效
    async fn transition_if_state(
        &self,
        id: &str,
        expected: ItemState,
        new_state: ItemState,
        update: &ItemUpdate,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    async fn list_by_state(&self, state: ItemState) -> PipelineResult<Vec<Item>>;

    async fn count_by_state(&self) -> PipelineResult<StateCounts>;

    /// 来源上次轮询时间
    async fn last_polled_at(&self, source_id: &str) -> PipelineResult<Option<DateTime<Utc>>>;

    async fn record_poll(&self, source_id: &str, at: DateTime<Utc>) -> PipelineResult<()>;
}

/// 工作身份仓储
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn list_identities(&self) -> PipelineResult<Vec<WorkerIdentity>>;

    async fn save_identity(&self, identity: &WorkerIdentity) -> PipelineResult<()>;

    /// 只写入健康状态字段，保留已持久化的启用标记；不存在时按完整身份插入
    async fn save_health(&self, identity: &WorkerIdentity) -> PipelineResult<()>;
}
