//! 安全网扫描
//!
//! 定期重新扫描持久化状态，防止事件丢失或进程中途重启导致条目卡住。

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::clock::chrono_duration;
use pipeline_core::PipelineResult;
use pipeline_domain::{EventPayload, ItemState, NotificationKind, StageError};
use tracing::{debug, info, warn};

use crate::concurrency_gate::Stage;
use crate::context::PipelineContext;
use crate::retry_service::{FailureResolution, RetryMode};

/// 一轮扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub abandoned: usize,
    pub skipped: usize,
}

impl RecoveryReport {
    fn record(&mut self, resolution: FailureResolution) {
        match resolution {
            FailureResolution::Requeued | FailureResolution::RetryNow => self.requeued += 1,
            FailureResolution::Abandoned => self.abandoned += 1,
            FailureResolution::Stale => self.skipped += 1,
        }
    }
}

pub struct RecoveryService {
    ctx: Arc<PipelineContext>,
    stuck_threshold: Duration,
}

impl RecoveryService {
    pub fn new(ctx: Arc<PipelineContext>, stuck_threshold: Duration) -> Self {
        Self {
            ctx,
            stuck_threshold,
        }
    }

    /// 重新入队停留在 Failed 的条目，预算已用完的条目放弃
    pub async fn retry_stale_failed(&self) -> PipelineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for item in self.ctx.repository.list_by_state(ItemState::Failed).await? {
            let Some(_lock) = self.ctx.gate.try_lock_item(&item.id) else {
                report.skipped += 1;
                continue;
            };
            let resolution = self.ctx.retry.resolve_failed(&item).await?;
            if resolution == FailureResolution::Requeued {
                self.ctx.wake_stage_for(&item, item.reentry_state());
            }
            report.record(resolution);
        }

        if report != RecoveryReport::default() {
            info!(
                requeued = report.requeued,
                abandoned = report.abandoned,
                skipped = report.skipped,
                "失败条目重试扫描完成"
            );
        }
        Ok(report)
    }

    /// 处理中状态停留过久且不在本进程处理中的条目，按一次瞬时失败处理
    pub async fn recover_stuck(&self) -> PipelineResult<RecoveryReport> {
        let cutoff = self.ctx.clock.now() - chrono_duration(self.stuck_threshold);
        let mut report = RecoveryReport::default();

        for (state, stage) in [
            (ItemState::Downloading, Stage::Download),
            (ItemState::Uploading, Stage::Upload),
        ] {
            for mut item in self.ctx.repository.list_by_state(state).await? {
                if item.updated_at > cutoff {
                    continue;
                }
                let Some(_lock) = self.ctx.gate.try_lock_item(&item.id) else {
                    debug!(item_id = %item.id, "条目正在处理中，不是卡住");
                    report.skipped += 1;
                    continue;
                };
                warn!(item_id = %item.id, %state, updated_at = %item.updated_at, "发现卡住的条目");
                let error = StageError::transient(format!("{state} 状态停留超时，处理可能已中断"));
                let resolution = self
                    .ctx
                    .retry
                    .handle_failure(&mut item, stage, &error, RetryMode::Deferred)
                    .await?;
                report.record(resolution);
            }
        }

        if report.requeued + report.abandoned > 0 {
            info!(
                requeued = report.requeued,
                abandoned = report.abandoned,
                "卡住条目恢复完成"
            );
        }
        Ok(report)
    }

    /// 清理已放弃条目残留的本地文件
    pub async fn cleanup_abandoned(&self) -> PipelineResult<usize> {
        let mut cleaned = 0;
        for item in self.ctx.repository.list_by_state(ItemState::Abandoned).await? {
            let Some(local_ref) = item.local_ref.as_deref() else {
                continue;
            };
            if let Err(e) = self.ctx.fetcher.discard(local_ref).await {
                warn!(item_id = %item.id, local_ref, "清理本地文件失败: {e}");
                continue;
            }
            if self.ctx.machine.clear_local_ref(&item).await?.is_applied() {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!("清理了 {cleaned} 个已放弃条目的本地文件");
        }
        Ok(cleaned)
    }

    /// 检查是否还有待处理的工作，有则重新发出事件
    pub async fn check_pending_work(&self) -> PipelineResult<()> {
        let now = self.ctx.clock.now();
        let discovered = self
            .ctx
            .repository
            .list_by_state(ItemState::Discovered)
            .await?;
        let due_discovered = discovered.iter().filter(|item| item.is_due(now)).count();
        if due_discovered > 0 {
            debug!(count = due_discovered, "仍有待下载的条目");
            self.ctx.events.publish(EventPayload::ItemsDiscovered {
                source_id: discovered[0].source_id.clone(),
                count: due_discovered,
            });
        }

        let downloaded = self
            .ctx
            .repository
            .list_by_state(ItemState::Downloaded)
            .await?;
        if let Some(item) = downloaded.iter().find(|item| item.is_due(now)) {
            debug!("仍有待上传的条目");
            self.ctx.events.publish(EventPayload::DownloadCompleted {
                item_id: item.id.clone(),
            });
        }
        Ok(())
    }

    /// 发送每日统计
    pub async fn send_daily_summary(&self) -> PipelineResult<()> {
        let counts = self.ctx.repository.count_by_state().await?;
        let health = self.ctx.pool.health();
        let available = health.iter().filter(|h| h.is_enabled && !h.cooling).count();
        let message = format!(
            "每日统计\n条目: {counts}\n工作身份: {available}/{} 可用",
            health.len()
        );
        info!("{message}");
        self.ctx
            .notifier
            .broadcast(NotificationKind::Summary, message)
            .await;
        Ok(())
    }
}
