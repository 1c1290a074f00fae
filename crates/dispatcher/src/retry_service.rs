//! 失败处理
//!
//! 处理器持有尝试循环：失败后根据重试策略和尝试预算决定原地等待重试、
//! 延后重新入队，或者放弃条目。

use std::sync::Arc;

use pipeline_core::clock::chrono_duration;
use pipeline_core::config::RetryConfig;
use pipeline_core::{Clock, PipelineResult};
use pipeline_domain::{
    decide, ErrorClass, FailureOutcome, Item, ItemError, ItemStateMachine, NotificationKind,
    StageError, TransitionOutcome,
};
use tracing::{info, warn};

use crate::concurrency_gate::Stage;
use crate::notification::ProgressNotifier;

/// 失败后的重试方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// 等待时间不超过上限时在处理器内等待后立即重试
    Inline,
    /// 总是重新入队，由后续的阶段处理
    Deferred,
}

/// 失败处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResolution {
    /// 已等待完毕，调用方应立即再次尝试
    RetryNow,
    Requeued,
    Abandoned,
    /// 条目已被其他处理者推进
    Stale,
}

pub struct RetryService {
    machine: Arc<ItemStateMachine>,
    notifier: Arc<ProgressNotifier>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl RetryService {
    pub fn new(
        machine: Arc<ItemStateMachine>,
        notifier: Arc<ProgressNotifier>,
        clock: Arc<dyn Clock>,
        config: RetryConfig,
    ) -> Self {
        Self {
            machine,
            notifier,
            clock,
            config,
        }
    }

    /// 处理一次阶段失败。`item` 必须处于该阶段的进行中状态，原地重试时会同步更新其尝试次数
    pub async fn handle_failure(
        &self,
        item: &mut Item,
        stage: Stage,
        error: &StageError,
        mode: RetryMode,
    ) -> PipelineResult<FailureResolution> {
        let attempt_index = item.attempt_count;
        let attempt_count = attempt_index.saturating_add(1);
        let decision = decide(error.class, attempt_index);

        metrics::counter!(
            "stage_attempts_total",
            "stage" => stage.as_str(),
            "outcome" => error.class.as_str()
        )
        .increment(1);

        if !decision.should_retry || attempt_count >= self.config.max_attempts {
            warn!(
                item_id = %item.id,
                %stage,
                attempt_count,
                error = %error,
                "条目处理失败，不再重试"
            );
            return self.abandon(item, attempt_count, error).await;
        }

        if mode == RetryMode::Inline && decision.wait <= self.config.inline_retry_max_wait() {
            if let TransitionOutcome::Stale =
                self.machine.record_attempt(item, attempt_count, error).await?
            {
                return Ok(FailureResolution::Stale);
            }
            item.attempt_count = attempt_count;
            item.last_error = Some(ItemError::from(error));

            info!(
                item_id = %item.id,
                %stage,
                attempt_count,
                wait_secs = decision.wait.as_secs(),
                "阶段失败，等待后重试: {error}"
            );
            self.clock.sleep(decision.wait).await;
            return Ok(FailureResolution::RetryNow);
        }

        let retry_at = self.clock.now() + chrono_duration(decision.wait);
        match self
            .machine
            .fail_and_requeue(item, attempt_count, error, Some(retry_at))
            .await?
        {
            FailureOutcome::Requeued { state, .. } => {
                info!(
                    item_id = %item.id,
                    %stage,
                    attempt_count,
                    reentry = %state,
                    %retry_at,
                    "条目重新入队等待重试: {error}"
                );
                self.notifier
                    .progress(
                        &item.id,
                        format!(
                            "{} {}失败 ({}/{})，将于 {} 重试",
                            item.display_name(),
                            stage_label(stage),
                            attempt_count,
                            self.config.max_attempts,
                            retry_at.format("%Y-%m-%d %H:%M:%S")
                        ),
                    )
                    .await;
                Ok(FailureResolution::Requeued)
            }
            FailureOutcome::Abandoned => Ok(FailureResolution::Abandoned),
            FailureOutcome::Stale => Ok(FailureResolution::Stale),
        }
    }

    /// 没有可用身份：按瞬时网络错误退避，但不消耗条目的尝试次数
    pub async fn defer_for_identity(&self, item: &Item) -> PipelineResult<FailureResolution> {
        let wait = decide(ErrorClass::TransientNetwork, item.attempt_count).wait;
        let retry_at = self.clock.now() + chrono_duration(wait);
        let error = StageError::transient("没有可用的工作身份");

        let outcome = self
            .machine
            .fail_and_requeue(item, item.attempt_count, &error, Some(retry_at))
            .await?;
        Ok(match outcome {
            FailureOutcome::Requeued { state, .. } => {
                info!(item_id = %item.id, reentry = %state, "没有可用的工作身份，条目重新入队");
                FailureResolution::Requeued
            }
            FailureOutcome::Abandoned => FailureResolution::Abandoned,
            FailureOutcome::Stale => FailureResolution::Stale,
        })
    }

    /// 处理停留在 Failed 的条目：预算未用完且最后的错误可重试则立即重新入队，否则放弃
    pub async fn resolve_failed(&self, item: &Item) -> PipelineResult<FailureResolution> {
        let terminal_error = item
            .last_error
            .as_ref()
            .is_some_and(|e| !decide(e.class, item.attempt_count).should_retry);
        if terminal_error || item.attempt_count >= self.config.max_attempts {
            return match self.machine.abandon_failed(item).await? {
                FailureOutcome::Abandoned => {
                    self.notify_abandoned(item, item.attempt_count).await;
                    Ok(FailureResolution::Abandoned)
                }
                _ => Ok(FailureResolution::Stale),
            };
        }

        match self.machine.requeue_failed(item, None).await? {
            FailureOutcome::Requeued { state, .. } => {
                info!(item_id = %item.id, reentry = %state, "重新入队失败条目");
                Ok(FailureResolution::Requeued)
            }
            FailureOutcome::Abandoned => Ok(FailureResolution::Abandoned),
            FailureOutcome::Stale => Ok(FailureResolution::Stale),
        }
    }

    async fn abandon(
        &self,
        item: &Item,
        attempt_count: u32,
        error: &StageError,
    ) -> PipelineResult<FailureResolution> {
        match self
            .machine
            .fail_and_abandon(item, attempt_count, error)
            .await?
        {
            FailureOutcome::Abandoned => {
                let mut abandoned = item.clone();
                abandoned.last_error = Some(ItemError::from(error));
                self.notify_abandoned(&abandoned, attempt_count).await;
                Ok(FailureResolution::Abandoned)
            }
            FailureOutcome::Requeued { .. } | FailureOutcome::Stale => {
                Ok(FailureResolution::Stale)
            }
        }
    }

    async fn notify_abandoned(&self, item: &Item, attempt_count: u32) {
        metrics::counter!("items_abandoned_total").increment(1);
        let reason = item
            .last_error
            .as_ref()
            .map(|e| format!("[{}] {}", e.class, e.message))
            .unwrap_or_else(|| "未知原因".to_string());
        warn!(item_id = %item.id, attempt_count, "条目已放弃: {reason}");
        self.notifier
            .terminal(
                &item.id,
                NotificationKind::Abandoned,
                format!(
                    "{} 处理失败，已放弃 (尝试 {} 次): {}",
                    item.display_name(),
                    attempt_count,
                    reason
                ),
            )
            .await;
    }
}

pub(crate) fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Download => "下载",
        Stage::Upload => "上传",
        Stage::Aux => "附件下载",
    }
}
