use std::sync::Arc;

use async_trait::async_trait;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{
    FailureOutcome, IdentityHealth, ItemState, PipelineStatus, StatusProvider,
};
use tracing::info;

use crate::context::PipelineContext;

/// 命令接口：状态查询、手动重试、身份启停
pub struct PipelineController {
    ctx: Arc<PipelineContext>,
}

impl PipelineController {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn identity_report(&self) -> Vec<IdentityHealth> {
        self.ctx.pool.health()
    }
}

#[async_trait]
impl StatusProvider for PipelineController {
    async fn get_status(&self) -> PipelineResult<PipelineStatus> {
        let counts = self.ctx.repository.count_by_state().await?;
        Ok(PipelineStatus {
            scheduler_state: self.ctx.scheduler_state().to_string(),
            counts,
            identities: self.ctx.pool.health(),
        })
    }

    async fn retry_item(&self, item_id: &str) -> PipelineResult<()> {
        let item = self
            .ctx
            .repository
            .get(item_id)
            .await?
            .ok_or_else(|| PipelineError::ItemNotFound {
                id: item_id.to_string(),
            })?;

        let state = match item.state {
            ItemState::Failed => {
                if item.attempt_count >= self.ctx.retry_config.max_attempts {
                    return Err(PipelineError::RetryBudgetExhausted {
                        id: item.id.clone(),
                        attempts: item.attempt_count,
                    });
                }
                match self.ctx.machine.requeue_failed(&item, None).await? {
                    FailureOutcome::Requeued { state, .. } => state,
                    _ => {
                        return Err(PipelineError::InvalidState {
                            id: item.id.clone(),
                            state: item.state.to_string(),
                        })
                    }
                }
            }
            ItemState::Discovered | ItemState::Downloaded => {
                if !self.ctx.machine.clear_backoff(&item).await?.is_applied() {
                    return Err(PipelineError::InvalidState {
                        id: item.id.clone(),
                        state: item.state.to_string(),
                    });
                }
                item.state
            }
            ItemState::Abandoned => {
                return Err(PipelineError::ItemAbandoned {
                    id: item.id.clone(),
                })
            }
            ItemState::Downloading | ItemState::Uploading | ItemState::Completed => {
                return Err(PipelineError::InvalidState {
                    id: item.id.clone(),
                    state: item.state.to_string(),
                })
            }
        };

        info!(item_id, %state, "手动重试条目");
        self.ctx.wake_stage_for(&item, state);
        Ok(())
    }

    async fn set_worker_identity_enabled(&self, name: &str, enabled: bool) -> PipelineResult<()> {
        self.ctx.pool.set_enabled(name, enabled).await
    }
}
