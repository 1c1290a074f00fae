use std::sync::Arc;

use pipeline_domain::{EventPayload, NotificationKind};
use tracing::{debug, info, warn};

use crate::concurrency_gate::Stage;
use crate::context::PipelineContext;

/// 下载条目描述中检测到的附件链接。尽力而为，不改变条目状态
pub async fn fetch_links(ctx: Arc<PipelineContext>, item_id: String) {
    let Some(link_fetcher) = ctx.link_fetcher.clone() else {
        return;
    };
    let item = match ctx.repository.get(&item_id).await {
        Ok(Some(item)) => item,
        Ok(None) => return,
        Err(e) => {
            ctx.escalate(&e).await;
            return;
        }
    };
    let links = item
        .description
        .as_deref()
        .map(|text| (ctx.link_detector)(text))
        .unwrap_or_default();
    if links.is_empty() {
        debug!(item_id = %item.id, "没有检测到附件链接");
        return;
    }

    info!(item_id = %item.id, count = links.len(), "开始下载附件链接");
    let results = futures::future::join_all(links.iter().map(|link| {
        let ctx = Arc::clone(&ctx);
        let link_fetcher = Arc::clone(&link_fetcher);
        let item = &item;
        async move {
            let _slot = ctx.gate.acquire_slot(Stage::Aux).await;
            link_fetcher.fetch_link(item, link).await
        }
    }))
    .await;

    let mut fetched = 0;
    let mut failed = 0;
    for (link, result) in links.iter().zip(results) {
        match result {
            Ok(local_ref) => {
                fetched += 1;
                debug!(file_id = %link.file_id, local_ref = %local_ref, "附件下载完成");
            }
            Err(e) => {
                failed += 1;
                warn!(file_id = %link.file_id, "附件下载失败: {e}");
            }
        }
    }

    ctx.notifier
        .item_info(
            &item.id,
            NotificationKind::AuxResult,
            format!(
                "{} 附件下载完成: 成功 {fetched} 个，失败 {failed} 个",
                item.display_name()
            ),
        )
        .await;
    ctx.events.publish(EventPayload::AuxDownloadCompleted {
        item_id: item.id.clone(),
        fetched,
        failed,
    });
}
