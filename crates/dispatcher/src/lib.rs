//! 流水线调度
//!
//! 事件总线、阶段处理器、工作身份池、并发闸门和安全网扫描，
//! 由 [`PipelineScheduler`] 组装并驱动。

pub mod concurrency_gate;
pub mod context;
pub mod controller;
pub mod event_bus;
pub mod notification;
pub mod recovery_service;
pub mod retry_service;
pub mod scheduler;
pub mod stages;
pub mod tracker;
pub mod trigger;
pub mod worker_pool;

pub use concurrency_gate::{ConcurrencyGate, GatePermit, ItemLock, Stage};
pub use context::{PipelineContext, SchedulerState};
pub use controller::PipelineController;
pub use event_bus::{EventPublisher, EventReceiver, Received};
pub use notification::ProgressNotifier;
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use retry_service::{FailureResolution, RetryMode, RetryService};
pub use scheduler::{PipelineScheduler, PipelineSchedulerBuilder};
pub use tracker::InFlightTracker;
pub use trigger::StageTrigger;
pub use worker_pool::WorkerPool;
