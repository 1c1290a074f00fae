use std::sync::Arc;
use std::time::Duration;

use pipeline_core::config::DatabaseConfig;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{IdentityRepository, ItemRepository};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{SqliteIdentityRepository, SqliteItemRepository};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        title TEXT,
        url TEXT NOT NULL,
        description TEXT,
        destination TEXT,
        state TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error_class TEXT,
        last_error_message TEXT,
        local_ref TEXT,
        remote_ref TEXT,
        skipped BOOLEAN NOT NULL DEFAULT FALSE,
        next_retry_at TEXT,
        discovered_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_state ON items(state)",
    r#"
    CREATE TABLE IF NOT EXISTS identities (
        name TEXT PRIMARY KEY,
        credentials TEXT,
        is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        failure_count INTEGER NOT NULL DEFAULT 0,
        cooldown_until TEXT,
        success_rate REAL NOT NULL DEFAULT 1.0,
        last_used_at TEXT,
        total_requests INTEGER NOT NULL DEFAULT 0,
        needs_session_refresh BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS source_polls (
        source_id TEXT PRIMARY KEY,
        last_polled_at TEXT NOT NULL
    )
    "#,
];

/// SQLite 连接池与仓储工厂
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> PipelineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(PipelineError::Database)?;
        info!("数据库连接池已创建: {}", config.url);
        Ok(Self { pool })
    }

    /// 建表，可重复执行
    pub async fn migrate(&self) -> PipelineResult<()> {
        debug!("执行数据库迁移");
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(PipelineError::Database)?;
        }
        debug!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PipelineError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn item_repository(&self) -> Arc<dyn ItemRepository> {
        Arc::new(SqliteItemRepository::new(self.pool.clone()))
    }

    pub fn identity_repository(&self) -> Arc<dyn IdentityRepository> {
        Arc::new(SqliteIdentityRepository::new(self.pool.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_repeatable() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        };
        let manager = DatabaseManager::new(&config).await.unwrap();
        manager.migrate().await.unwrap();
        manager.migrate().await.unwrap();
        manager.health_check().await.unwrap();
        manager.close().await;
    }
}
