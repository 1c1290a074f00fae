//! 外部协作方接口
//!
//! 来源列举、下载、上传、通知等操作都在核心之外实现，这里只定义窄接口。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::PipelineResult;
use serde::{Deserialize, Serialize};

use crate::entities::{Item, ItemDraft, PipelineStatus, WorkerIdentity};
use crate::errors::StageError;
use crate::links::Link;

/// 下载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 下载完成，附带本地产物引用
    Fetched(String),
    /// 按策略跳过（如直播、已存在），按合成成功处理
    Skipped { reason: String },
}

/// 来源列举
#[async_trait]
pub trait SourceLister: Send + Sync {
    /// 需要轮询的来源ID
    fn sources(&self) -> Vec<String>;

    async fn list_new_items(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemDraft>, StageError>;
}

/// 下载
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &Item, identity: &WorkerIdentity)
        -> Result<FetchOutcome, StageError>;

    /// 清理本地产物
    async fn discard(&self, _local_ref: &str) -> Result<(), StageError> {
        Ok(())
    }

    /// 认证失败后刷新身份的会话/凭据
    async fn refresh_session(&self, _identity: &WorkerIdentity) -> Result<(), StageError> {
        Ok(())
    }
}

/// 上传
#[async_trait]
pub trait Publisher: Send + Sync {
    /// 返回远端引用
    async fn publish(&self, local_ref: &str, destination: &str) -> Result<String, StageError>;
}

/// 附件链接下载
#[async_trait]
pub trait LinkFetcher: Send + Sync {
    async fn fetch_link(&self, item: &Item, link: &Link) -> Result<String, StageError>;
}

/// 链接检测函数
pub type LinkDetector = dyn Fn(&str) -> Vec<Link> + Send + Sync;

/// 通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Progress,
    Completed,
    Abandoned,
    AuxResult,
    Summary,
    Lifecycle,
    StorageError,
}

/// 通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub item_id: Option<String>,
    pub message: String,
}

impl Notification {
    pub fn for_item(kind: NotificationKind, item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: Some(item_id.into()),
            message: message.into(),
        }
    }

    pub fn broadcast(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: None,
            message: message.into(),
        }
    }
}

/// 已发送通知的句柄，用于撤回
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationHandle(pub String);

/// 通知发送方，失败只记录日志，不阻塞流水线
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> PipelineResult<Option<NotificationHandle>>;

    async fn retract(&self, _handle: &NotificationHandle) -> PipelineResult<()> {
        Ok(())
    }
}

/// 对外暴露的命令接口
#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn get_status(&self) -> PipelineResult<PipelineStatus>;

    /// 手动重新入队，跳过退避但仍受最大尝试次数限制
    async fn retry_item(&self, item_id: &str) -> PipelineResult<()>;

    async fn set_worker_identity_enabled(&self, name: &str, enabled: bool) -> PipelineResult<()>;
}
