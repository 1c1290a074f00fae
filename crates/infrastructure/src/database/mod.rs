pub mod manager;
mod mapping;
pub mod sqlite_identity_repository;
pub mod sqlite_item_repository;

pub use manager::DatabaseManager;
pub use sqlite_identity_repository::SqliteIdentityRepository;
pub use sqlite_item_repository::SqliteItemRepository;
