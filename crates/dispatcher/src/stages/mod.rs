//! 阶段处理器
//!
//! 每个处理器都重新查询持久化状态，事件内容只作为唤醒信号。

pub mod aux;
pub mod download;
pub mod upload;

use std::future::Future;
use std::sync::Arc;

use pipeline_core::PipelineResult;
use pipeline_domain::{Item, ItemState};
use tracing::debug;

use crate::context::PipelineContext;
use crate::trigger::StageTrigger;

/// 对某个状态下已到期的条目执行一轮处理。阶段已在排空时直接返回 false
pub(crate) async fn drain<F, Fut>(
    ctx: &Arc<PipelineContext>,
    trigger: &StageTrigger,
    state: ItemState,
    process: F,
) -> bool
where
    F: Fn(Arc<PipelineContext>, Item) -> Fut,
    Fut: Future<Output = PipelineResult<()>>,
{
    let Some(_guard) = trigger.try_begin() else {
        debug!(stage = trigger.name(), "阶段正在处理中，忽略本次触发");
        return false;
    };

    let items = match ctx.repository.list_by_state(state).await {
        Ok(items) => items,
        Err(e) => {
            ctx.escalate(&e).await;
            return true;
        }
    };
    let now = ctx.clock.now();
    let due: Vec<Item> = items.into_iter().filter(|item| item.is_due(now)).collect();
    if due.is_empty() {
        debug!(stage = trigger.name(), "没有待处理的条目");
        return true;
    }

    debug!(stage = trigger.name(), count = due.len(), "开始处理待处理条目");
    let results = futures::future::join_all(
        due.into_iter()
            .map(|item| process(Arc::clone(ctx), item)),
    )
    .await;

    for result in results {
        if let Err(e) = result {
            ctx.escalate(&e).await;
        }
    }
    true
}
