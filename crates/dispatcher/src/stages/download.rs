use std::sync::Arc;
use std::time::Instant;

use pipeline_core::PipelineError;
use pipeline_core::PipelineResult;
use pipeline_domain::{
    decide, ErrorClass, EventPayload, FetchOutcome, Item, ItemState, StageError, WorkerIdentity,
};
use tracing::{debug, info, info_span, Instrument};

use super::drain;
use crate::concurrency_gate::Stage;
use crate::context::PipelineContext;
use crate::retry_service::{FailureResolution, RetryMode};

/// 下载阶段排空一轮
pub async fn drain_downloads(ctx: Arc<PipelineContext>) -> bool {
    let trigger = &ctx.download_trigger;
    drain(&ctx, trigger, ItemState::Discovered, |ctx, item| async move {
        download_item(&ctx, &item.id).await
    })
    .await
}

/// 下载单个条目。只有仓储写入失败才返回错误
pub async fn download_item(ctx: &PipelineContext, item_id: &str) -> PipelineResult<()> {
    let Some(_permit) = ctx.gate.acquire(Stage::Download, item_id).await else {
        return Ok(());
    };

    let Some(mut item) = ctx.repository.get(item_id).await? else {
        return Ok(());
    };
    if item.state != ItemState::Discovered || !item.is_due(ctx.clock.now()) {
        return Ok(());
    }
    if !ctx.machine.begin_download(item_id).await?.is_applied() {
        return Ok(());
    }
    item.state = ItemState::Downloading;

    let span = info_span!("download", item_id = %item.id);
    run_attempts(ctx, &mut item).instrument(span).await
}

async fn run_attempts(ctx: &PipelineContext, item: &mut Item) -> PipelineResult<()> {
    let started = Instant::now();
    info!("开始下载: {}", item.display_name());
    ctx.notifier
        .progress(&item.id, format!("正在下载: {}", item.display_name()))
        .await;

    loop {
        let identity = match ctx.pool.select() {
            Ok(identity) => identity,
            Err(PipelineError::NoIdentityAvailable) => {
                ctx.retry.defer_for_identity(item).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match fetch_with_identity(ctx, item, &identity).await {
            Ok(outcome) => {
                ctx.pool.record_success(&identity.name).await;
                metrics::histogram!("stage_duration_seconds", "stage" => "download")
                    .record(started.elapsed().as_secs_f64());
                return finish(ctx, item, outcome).await;
            }
            Err(error) => {
                if penalizes_identity(error.class) {
                    let decision = decide(error.class, item.attempt_count);
                    ctx.pool
                        .record_failure(&identity.name, decision.escalate)
                        .await;
                }
                match ctx
                    .retry
                    .handle_failure(item, Stage::Download, &error, RetryMode::Inline)
                    .await?
                {
                    FailureResolution::RetryNow => continue,
                    _ => return Ok(()),
                }
            }
        }
    }
}

/// 条目本身的问题和平台级配额不计入身份的失败
fn penalizes_identity(class: ErrorClass) -> bool {
    !class.is_item_specific() && class != ErrorClass::QuotaExceeded
}

async fn fetch_with_identity(
    ctx: &PipelineContext,
    item: &Item,
    identity: &WorkerIdentity,
) -> Result<FetchOutcome, StageError> {
    if identity.needs_session_refresh {
        info!(identity = %identity.name, "刷新工作身份会话");
        ctx.fetcher.refresh_session(identity).await?;
        ctx.pool.mark_session_refreshed(&identity.name).await;
    }
    debug!(identity = %identity.name, "使用工作身份下载");
    ctx.fetcher.fetch(item, identity).await
}

async fn finish(ctx: &PipelineContext, item: &Item, outcome: FetchOutcome) -> PipelineResult<()> {
    if !ctx.machine.complete_download(&item.id, &outcome).await?.is_applied() {
        return Ok(());
    }
    metrics::counter!("stage_attempts_total", "stage" => "download", "outcome" => "success")
        .increment(1);

    let message = match &outcome {
        FetchOutcome::Fetched(local_ref) => {
            info!(local_ref = %local_ref, "下载完成");
            format!("下载完成: {}", item.display_name())
        }
        FetchOutcome::Skipped { reason } => {
            info!(reason = %reason, "跳过下载");
            format!("跳过下载: {} ({reason})", item.display_name())
        }
    };
    ctx.notifier.progress(&item.id, message).await;

    ctx.events.publish(EventPayload::DownloadCompleted {
        item_id: item.id.clone(),
    });

    let has_links = ctx.link_fetcher.is_some()
        && item
            .description
            .as_deref()
            .is_some_and(|text| !(ctx.link_detector)(text).is_empty());
    if has_links {
        ctx.events.publish(EventPayload::AuxDownloadNeeded {
            item_id: item.id.clone(),
        });
    }
    Ok(())
}
