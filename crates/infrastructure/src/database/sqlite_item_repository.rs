use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{
    FieldUpdate, Item, ItemDraft, ItemRepository, ItemState, ItemUpdate, StateCounts,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use super::mapping::{row_to_item, ITEM_COLUMNS};

pub struct SqliteItemRepository {
    pool: SqlitePool,
}

impl SqliteItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_field_updates(builder: &mut QueryBuilder<'_, Sqlite>, update: &ItemUpdate) {
    if let Some(attempt_count) = update.attempt_count {
        builder
            .push(", attempt_count = ")
            .push_bind(i64::from(attempt_count));
    }
    match &update.last_error {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(error) => {
            builder
                .push(", last_error_class = ")
                .push_bind(error.class.as_str())
                .push(", last_error_message = ")
                .push_bind(error.message.clone());
        }
        FieldUpdate::Clear => {
            builder.push(", last_error_class = NULL, last_error_message = NULL");
        }
    }
    match &update.local_ref {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(local_ref) => {
            builder.push(", local_ref = ").push_bind(local_ref.clone());
        }
        FieldUpdate::Clear => {
            builder.push(", local_ref = NULL");
        }
    }
    match &update.remote_ref {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(remote_ref) => {
            builder.push(", remote_ref = ").push_bind(remote_ref.clone());
        }
        FieldUpdate::Clear => {
            builder.push(", remote_ref = NULL");
        }
    }
    if let Some(skipped) = update.skipped {
        builder.push(", skipped = ").push_bind(skipped);
    }
    match &update.next_retry_at {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(at) => {
            builder.push(", next_retry_at = ").push_bind(*at);
        }
        FieldUpdate::Clear => {
            builder.push(", next_retry_at = NULL");
        }
    }
}

#[async_trait]
impl ItemRepository for SqliteItemRepository {
    async fn insert_if_absent(&self, draft: &ItemDraft, now: DateTime<Utc>) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, source_id, title, url, description, destination, state,
                               attempt_count, skipped, discovered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, FALSE, $8, $9)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&draft.id)
        .bind(&draft.source_id)
        .bind(&draft.title)
        .bind(&draft.url)
        .bind(&draft.description)
        .bind(&draft.destination)
        .bind(ItemState::Discovered.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!("记录新条目: {}", draft.id);
        }
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        row.as_ref().map(row_to_item).transpose()
    }

    async fn transition_if_state(
        &self,
        id: &str,
        expected: ItemState,
        new_state: ItemState,
        update: &ItemUpdate,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE items SET state = ");
        builder.push_bind(new_state.as_str());
        builder.push(", updated_at = ").push_bind(now);
        push_field_updates(&mut builder, update);
        builder.push(" WHERE id = ").push_bind(id);
        builder.push(" AND state = ").push_bind(expected.as_str());

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(PipelineError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_by_state(&self, state: ItemState) -> PipelineResult<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE state = $1 ORDER BY discovered_at, id"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        rows.iter().map(row_to_item).collect()
    }

    async fn count_by_state(&self) -> PipelineResult<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM items GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let state = state
                .parse::<ItemState>()
                .map_err(PipelineError::Serialization)?;
            counts.set(state, row.try_get::<i64, _>("count")? as u64);
        }
        Ok(counts)
    }

    async fn last_polled_at(&self, source_id: &str) -> PipelineResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_polled_at FROM source_polls WHERE source_id = $1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        match row {
            Some(row) => Ok(Some(row.try_get("last_polled_at")?)),
            None => Ok(None),
        }
    }

    async fn record_poll(&self, source_id: &str, at: DateTime<Utc>) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_polls (source_id, last_polled_at)
            VALUES ($1, $2)
            ON CONFLICT(source_id) DO UPDATE SET last_polled_at = excluded.last_polled_at
            "#,
        )
        .bind(source_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::Database)?;
        Ok(())
    }
}
