//! 存储与通知实现

pub mod database;
pub mod in_memory;
pub mod notifiers;

pub use database::{DatabaseManager, SqliteIdentityRepository, SqliteItemRepository};
pub use in_memory::{InMemoryIdentityRepository, InMemoryItemRepository};
pub use notifiers::{RecordingNotifier, TracingNotifier, WebhookNotifier};
