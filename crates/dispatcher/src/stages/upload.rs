use std::sync::Arc;
use std::time::Instant;

use pipeline_core::PipelineResult;
use pipeline_domain::{EventPayload, Item, ItemState, NotificationKind, StageError};
use tracing::{debug, info, info_span, warn, Instrument};

use super::drain;
use crate::concurrency_gate::Stage;
use crate::context::PipelineContext;
use crate::retry_service::{FailureResolution, RetryMode};

/// 上传阶段排空一轮
pub async fn drain_uploads(ctx: Arc<PipelineContext>) -> bool {
    let trigger = &ctx.upload_trigger;
    drain(&ctx, trigger, ItemState::Downloaded, |ctx, item| async move {
        upload_item(&ctx, &item.id).await
    })
    .await
}

pub async fn upload_item(ctx: &PipelineContext, item_id: &str) -> PipelineResult<()> {
    let Some(_permit) = ctx.gate.acquire(Stage::Upload, item_id).await else {
        return Ok(());
    };

    let Some(mut item) = ctx.repository.get(item_id).await? else {
        return Ok(());
    };
    if item.state != ItemState::Downloaded || !item.is_due(ctx.clock.now()) {
        return Ok(());
    }
    if !ctx.machine.begin_upload(item_id).await?.is_applied() {
        return Ok(());
    }
    item.state = ItemState::Uploading;

    let span = info_span!("upload", item_id = %item.id);
    run_attempts(ctx, &mut item).instrument(span).await
}

async fn run_attempts(ctx: &PipelineContext, item: &mut Item) -> PipelineResult<()> {
    if item.skipped {
        finish(ctx, item, None).await?;
        return Ok(());
    }

    let Some(local_ref) = item.local_ref.clone() else {
        warn!("条目缺少本地文件引用，重新下载");
        let error = StageError::unknown("缺少本地文件引用");
        ctx.retry
            .handle_failure(item, Stage::Upload, &error, RetryMode::Deferred)
            .await?;
        return Ok(());
    };
    let destination = item
        .destination
        .clone()
        .unwrap_or_else(|| ctx.default_destination.clone());

    let started = Instant::now();
    info!(destination = %destination, "开始上传: {}", item.display_name());
    loop {
        match ctx.publisher.publish(&local_ref, &destination).await {
            Ok(remote_ref) => {
                metrics::histogram!("stage_duration_seconds", "stage" => "upload")
                    .record(started.elapsed().as_secs_f64());
                // 状态已被其他处理者推进时，本地文件可能仍被使用
                if !finish(ctx, item, Some(remote_ref)).await? {
                    return Ok(());
                }
                if let Err(e) = ctx.fetcher.discard(&local_ref).await {
                    warn!(local_ref = %local_ref, "清理本地文件失败: {e}");
                }
                return Ok(());
            }
            Err(error) => {
                match ctx
                    .retry
                    .handle_failure(item, Stage::Upload, &error, RetryMode::Inline)
                    .await?
                {
                    FailureResolution::RetryNow => continue,
                    _ => return Ok(()),
                }
            }
        }
    }
}

/// 跳过下载的条目没有远端引用，按合成成功完成。返回完成转换是否生效
async fn finish(ctx: &PipelineContext, item: &Item, remote_ref: Option<String>) -> PipelineResult<bool> {
    if !ctx
        .machine
        .complete_upload(&item.id, remote_ref.clone())
        .await?
        .is_applied()
    {
        debug!("条目状态已变化，放弃完成转换");
        return Ok(false);
    }
    metrics::counter!("stage_attempts_total", "stage" => "upload", "outcome" => "success")
        .increment(1);

    let message = match &remote_ref {
        Some(remote_ref) => {
            info!(remote_ref = %remote_ref, "上传完成");
            format!("{} 已完成: {remote_ref}", item.display_name())
        }
        None => {
            info!("下载被跳过的条目直接完成");
            format!("{} 已完成 (下载被跳过)", item.display_name())
        }
    };
    ctx.notifier
        .terminal(&item.id, NotificationKind::Completed, message)
        .await;

    ctx.events.publish(EventPayload::UploadCompleted {
        item_id: item.id.clone(),
    });
    Ok(true)
}
