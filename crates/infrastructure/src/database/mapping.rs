//! 行到实体的映射

use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{ErrorClass, Item, ItemError, ItemState, WorkerIdentity};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) const ITEM_COLUMNS: &str = "id, source_id, title, url, description, destination, state, \
     attempt_count, last_error_class, last_error_message, local_ref, remote_ref, skipped, \
     next_retry_at, discovered_at, updated_at";

pub(crate) const IDENTITY_COLUMNS: &str = "name, credentials, is_enabled, failure_count, \
     cooldown_until, success_rate, last_used_at, total_requests, needs_session_refresh";

pub(crate) fn row_to_item(row: &SqliteRow) -> PipelineResult<Item> {
    let state: String = row.try_get("state")?;
    let state = state.parse::<ItemState>().map_err(PipelineError::Serialization)?;

    let error_class: Option<String> = row.try_get("last_error_class")?;
    let last_error = match error_class {
        Some(class) => Some(ItemError {
            class: class
                .parse::<ErrorClass>()
                .map_err(PipelineError::Serialization)?,
            message: row
                .try_get::<Option<String>, _>("last_error_message")?
                .unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Item {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        destination: row.try_get("destination")?,
        state,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        last_error,
        local_ref: row.try_get("local_ref")?,
        remote_ref: row.try_get("remote_ref")?,
        skipped: row.try_get("skipped")?,
        next_retry_at: row.try_get("next_retry_at")?,
        discovered_at: row.try_get("discovered_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn row_to_identity(row: &SqliteRow) -> PipelineResult<WorkerIdentity> {
    Ok(WorkerIdentity {
        name: row.try_get("name")?,
        credentials: row.try_get("credentials")?,
        is_enabled: row.try_get("is_enabled")?,
        failure_count: row.try_get::<i64, _>("failure_count")? as u32,
        cooldown_until: row.try_get("cooldown_until")?,
        success_rate: row.try_get("success_rate")?,
        last_used_at: row.try_get("last_used_at")?,
        total_requests: row.try_get::<i64, _>("total_requests")? as u64,
        needs_session_refresh: row.try_get("needs_session_refresh")?,
    })
}
