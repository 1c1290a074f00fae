mod app_config;
mod sections;

pub use app_config::AppConfig;
pub use sections::{
    DatabaseConfig, FetcherConfig, IdentityConfig, NotifierConfig, ObservabilityConfig,
    PublisherConfig, RetryConfig, SchedulerConfig, SourceConfig, StageConfig, WorkerPoolConfig,
};
