//! 条目状态机
//!
//! 所有状态转换都是比较并交换：只有持久化状态与预期前置状态一致时才生效。
//! 转换未生效说明其他处理者已经推进了该条目，调用方按“已处理”对待，不是错误。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_core::{Clock, PipelineError, PipelineResult};
use tracing::debug;

use crate::entities::{FieldUpdate, Item, ItemState, ItemUpdate};
use crate::errors::StageError;
use crate::ports::FetchOutcome;
use crate::repositories::ItemRepository;

/// 状态转换表。同状态转换只更新字段
pub fn can_transition(from: ItemState, to: ItemState) -> bool {
    use ItemState::*;
    from == to
        || matches!(
            (from, to),
            (Discovered, Downloading)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloaded, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Failed, Discovered)
                | (Failed, Downloaded)
                | (Failed, Abandoned)
        )
}

/// 转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// 前置状态不匹配，已被其他处理者推进
    Stale,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// 失败处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// 已重新入队，退避到期后再处理
    Requeued {
        state: ItemState,
        retry_at: Option<DateTime<Utc>>,
    },
    /// 本次调用把条目推进到了 Abandoned
    Abandoned,
    Stale,
}

pub struct ItemStateMachine {
    repository: Arc<dyn ItemRepository>,
    clock: Arc<dyn Clock>,
}

impl ItemStateMachine {
    pub fn new(repository: Arc<dyn ItemRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    pub fn repository(&self) -> &Arc<dyn ItemRepository> {
        &self.repository
    }

    pub async fn transition(
        &self,
        item_id: &str,
        from: ItemState,
        to: ItemState,
        update: ItemUpdate,
    ) -> PipelineResult<TransitionOutcome> {
        if !can_transition(from, to) {
            return Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let applied = self
            .repository
            .transition_if_state(item_id, from, to, &update, self.clock.now())
            .await?;

        if applied {
            debug!(item_id, %from, %to, "条目状态已更新");
            Ok(TransitionOutcome::Applied)
        } else {
            debug!(item_id, %from, %to, "条目状态已被其他处理者推进，不是错误，只是忽略");
            Ok(TransitionOutcome::Stale)
        }
    }

    pub async fn begin_download(&self, item_id: &str) -> PipelineResult<TransitionOutcome> {
        self.transition(
            item_id,
            ItemState::Discovered,
            ItemState::Downloading,
            ItemUpdate::default(),
        )
        .await
    }

    /// 下载成功或被跳过都推进到 Downloaded，并清零尝试次数
    pub async fn complete_download(
        &self,
        item_id: &str,
        outcome: &FetchOutcome,
    ) -> PipelineResult<TransitionOutcome> {
        let update = match outcome {
            FetchOutcome::Fetched(local_ref) => ItemUpdate::stage_success()
                .with_local_ref(FieldUpdate::Set(local_ref.clone()))
                .with_skipped(false),
            FetchOutcome::Skipped { .. } => ItemUpdate::stage_success()
                .with_local_ref(FieldUpdate::Clear)
                .with_skipped(true),
        };
        self.transition(item_id, ItemState::Downloading, ItemState::Downloaded, update)
            .await
    }

    pub async fn begin_upload(&self, item_id: &str) -> PipelineResult<TransitionOutcome> {
        self.transition(
            item_id,
            ItemState::Downloaded,
            ItemState::Uploading,
            ItemUpdate::default(),
        )
        .await
    }

    /// 上传完成，本地产物随后会被清理，因此一并清空 local_ref
    pub async fn complete_upload(
        &self,
        item_id: &str,
        remote_ref: Option<String>,
    ) -> PipelineResult<TransitionOutcome> {
        let remote_ref = match remote_ref {
            Some(remote_ref) => FieldUpdate::Set(remote_ref),
            None => FieldUpdate::Keep,
        };
        let update = ItemUpdate::stage_success()
            .with_remote_ref(remote_ref)
            .with_local_ref(FieldUpdate::Clear);
        self.transition(item_id, ItemState::Uploading, ItemState::Completed, update)
            .await
    }

    /// 原地重试前记录本次失败，状态保持不变
    pub async fn record_attempt(
        &self,
        item: &Item,
        attempt_count: u32,
        error: &StageError,
    ) -> PipelineResult<TransitionOutcome> {
        self.transition(
            &item.id,
            item.state,
            item.state,
            ItemUpdate::failure(attempt_count, error),
        )
        .await
    }

    /// 进入 Failed 后立即从重新入口进入队列
    pub async fn fail_and_requeue(
        &self,
        item: &Item,
        attempt_count: u32,
        error: &StageError,
        retry_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<FailureOutcome> {
        let outcome = self
            .transition(
                &item.id,
                item.state,
                ItemState::Failed,
                ItemUpdate::failure(attempt_count, error),
            )
            .await?;
        if !outcome.is_applied() {
            return Ok(FailureOutcome::Stale);
        }
        self.requeue_failed(item, retry_at).await
    }

    /// 进入 Failed 后放弃
    pub async fn fail_and_abandon(
        &self,
        item: &Item,
        attempt_count: u32,
        error: &StageError,
    ) -> PipelineResult<FailureOutcome> {
        let outcome = self
            .transition(
                &item.id,
                item.state,
                ItemState::Failed,
                ItemUpdate::failure(attempt_count, error),
            )
            .await?;
        if !outcome.is_applied() {
            return Ok(FailureOutcome::Stale);
        }
        self.abandon_failed(item).await
    }

    /// Failed 条目重新入队，入口由是否已有本地产物决定
    pub async fn requeue_failed(
        &self,
        item: &Item,
        retry_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<FailureOutcome> {
        let state = item.reentry_state();
        let next_retry_at = match retry_at {
            Some(at) => FieldUpdate::Set(at),
            None => FieldUpdate::Clear,
        };
        let outcome = self
            .transition(
                &item.id,
                ItemState::Failed,
                state,
                ItemUpdate::default().with_next_retry_at(next_retry_at),
            )
            .await?;
        Ok(match outcome {
            TransitionOutcome::Applied => FailureOutcome::Requeued { state, retry_at },
            TransitionOutcome::Stale => FailureOutcome::Stale,
        })
    }

    pub async fn abandon_failed(&self, item: &Item) -> PipelineResult<FailureOutcome> {
        let outcome = self
            .transition(
                &item.id,
                ItemState::Failed,
                ItemState::Abandoned,
                ItemUpdate::default().with_next_retry_at(FieldUpdate::Clear),
            )
            .await?;
        Ok(match outcome {
            TransitionOutcome::Applied => FailureOutcome::Abandoned,
            TransitionOutcome::Stale => FailureOutcome::Stale,
        })
    }

    /// 清除退避时间，让条目在下一轮立即被处理
    pub async fn clear_backoff(&self, item: &Item) -> PipelineResult<TransitionOutcome> {
        self.transition(
            &item.id,
            item.state,
            item.state,
            ItemUpdate::default().with_next_retry_at(FieldUpdate::Clear),
        )
        .await
    }

    /// 清空本地产物引用（清理任务使用）
    pub async fn clear_local_ref(&self, item: &Item) -> PipelineResult<TransitionOutcome> {
        self.transition(
            &item.id,
            item.state,
            item.state,
            ItemUpdate::default().with_local_ref(FieldUpdate::Clear),
        )
        .await
    }
}
