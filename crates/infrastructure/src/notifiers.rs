//! 通知发送实现

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::config::NotifierConfig;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{Notification, NotificationHandle, NotificationKind, Notifier};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 把通知写入日志
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> PipelineResult<Option<NotificationHandle>> {
        let handle = NotificationHandle(Uuid::new_v4().to_string());
        match notification.kind {
            NotificationKind::Abandoned | NotificationKind::StorageError => warn!(
                kind = ?notification.kind,
                item_id = notification.item_id.as_deref().unwrap_or("-"),
                handle = %handle.0,
                "{}",
                notification.message
            ),
            _ => info!(
                kind = ?notification.kind,
                item_id = notification.item_id.as_deref().unwrap_or("-"),
                handle = %handle.0,
                "{}",
                notification.message
            ),
        }
        Ok(Some(handle))
    }

    async fn retract(&self, handle: &NotificationHandle) -> PipelineResult<()> {
        debug!(handle = %handle.0, "撤回通知");
        Ok(())
    }
}

/// 通过 HTTP 回调发送通知
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// 配置了回调地址时创建
    pub fn from_config(config: &NotifierConfig) -> PipelineResult<Option<Self>> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), Duration::from_secs(config.timeout_seconds)))
            .transpose()
    }

    async fn post(&self, body: serde_json::Value) -> PipelineResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("发送通知失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!("通知回调返回 HTTP {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> PipelineResult<Option<NotificationHandle>> {
        let handle = NotificationHandle(Uuid::new_v4().to_string());
        self.post(json!({
            "action": "notify",
            "handle": handle.0,
            "kind": notification.kind,
            "item_id": notification.item_id,
            "message": notification.message,
        }))
        .await?;
        Ok(Some(handle))
    }

    async fn retract(&self, handle: &NotificationHandle) -> PipelineResult<()> {
        self.post(json!({
            "action": "retract",
            "handle": handle.0,
        }))
        .await
    }
}

/// 记录所有通知，供检查发送结果
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    retracted: Mutex<Vec<NotificationHandle>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_of(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|notification| notification.kind == kind)
            .collect()
    }

    pub fn retracted(&self) -> usize {
        self.retracted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> PipelineResult<Option<NotificationHandle>> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(notification.clone());
        Ok(Some(NotificationHandle(format!("n-{}", sent.len()))))
    }

    async fn retract(&self, handle: &NotificationHandle) -> PipelineResult<()> {
        self.retracted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Ok(())
    }
}
