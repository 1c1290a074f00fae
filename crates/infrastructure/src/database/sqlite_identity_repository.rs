use async_trait::async_trait;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{IdentityRepository, WorkerIdentity};
use sqlx::SqlitePool;
use tracing::debug;

use super::mapping::{row_to_identity, IDENTITY_COLUMNS};

pub struct SqliteIdentityRepository {
    pool: SqlitePool,
}

impl SqliteIdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityRepository for SqliteIdentityRepository {
    async fn list_identities(&self) -> PipelineResult<Vec<WorkerIdentity>> {
        let rows = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        rows.iter().map(row_to_identity).collect()
    }

    async fn save_identity(&self, identity: &WorkerIdentity) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identities (name, credentials, is_enabled, failure_count, cooldown_until,
                                    success_rate, last_used_at, total_requests, needs_session_refresh)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(name) DO UPDATE SET
                credentials = excluded.credentials,
                is_enabled = excluded.is_enabled,
                failure_count = excluded.failure_count,
                cooldown_until = excluded.cooldown_until,
                success_rate = excluded.success_rate,
                last_used_at = excluded.last_used_at,
                total_requests = excluded.total_requests,
                needs_session_refresh = excluded.needs_session_refresh
            "#,
        )
        .bind(&identity.name)
        .bind(&identity.credentials)
        .bind(identity.is_enabled)
        .bind(i64::from(identity.failure_count))
        .bind(identity.cooldown_until)
        .bind(identity.success_rate)
        .bind(identity.last_used_at)
        .bind(identity.total_requests as i64)
        .bind(identity.needs_session_refresh)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        debug!("保存工作身份: {}", identity.name);
        Ok(())
    }

    async fn save_health(&self, identity: &WorkerIdentity) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identities (name, credentials, is_enabled, failure_count, cooldown_until,
                                    success_rate, last_used_at, total_requests, needs_session_refresh)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(name) DO UPDATE SET
                failure_count = excluded.failure_count,
                cooldown_until = excluded.cooldown_until,
                success_rate = excluded.success_rate,
                last_used_at = excluded.last_used_at,
                total_requests = excluded.total_requests,
                needs_session_refresh = excluded.needs_session_refresh
            "#,
        )
        .bind(&identity.name)
        .bind(&identity.credentials)
        .bind(identity.is_enabled)
        .bind(i64::from(identity.failure_count))
        .bind(identity.cooldown_until)
        .bind(identity.success_rate)
        .bind(identity.last_used_at)
        .bind(identity.total_requests as i64)
        .bind(identity.needs_session_refresh)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        debug!("保存工作身份健康状态: {}", identity.name);
        Ok(())
    }
}
