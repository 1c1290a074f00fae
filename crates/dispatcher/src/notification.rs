//! 进度通知
//!
//! 同一条目的新进度通知会撤回之前的进度通知，终态通知撤回全部进度通知。
//! 通知失败只记录日志，不影响流水线。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use pipeline_domain::{Notification, NotificationHandle, NotificationKind, Notifier};
use tracing::warn;

pub struct ProgressNotifier {
    notifier: Arc<dyn Notifier>,
    handles: Mutex<HashMap<String, Vec<NotificationHandle>>>,
}

impl ProgressNotifier {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn take_handles(&self, item_id: &str) -> Vec<NotificationHandle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item_id)
            .unwrap_or_default()
    }

    async fn retract_all(&self, item_id: &str) {
        for handle in self.take_handles(item_id) {
            if let Err(e) = self.notifier.retract(&handle).await {
                warn!(item_id, "撤回通知失败: {e}");
            }
        }
    }

    async fn send(&self, notification: &Notification) -> Option<NotificationHandle> {
        match self.notifier.notify(notification).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(kind = ?notification.kind, "发送通知失败: {e}");
                None
            }
        }
    }

    /// 发送进度通知，并撤回该条目之前的进度通知
    pub async fn progress(&self, item_id: &str, message: impl Into<String>) {
        self.retract_all(item_id).await;
        let notification = Notification::for_item(NotificationKind::Progress, item_id, message);
        if let Some(handle) = self.send(&notification).await {
            self.handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(item_id.to_string())
                .or_default()
                .push(handle);
        }
    }

    /// 终态通知（完成或放弃）
    pub async fn terminal(&self, item_id: &str, kind: NotificationKind, message: impl Into<String>) {
        self.retract_all(item_id).await;
        self.send(&Notification::for_item(kind, item_id, message)).await;
    }

    /// 与条目无关的通知（日报、生命周期、存储错误）
    pub async fn broadcast(&self, kind: NotificationKind, message: impl Into<String>) {
        self.send(&Notification::broadcast(kind, message)).await;
    }

    /// 附件结果不撤回进度
    pub async fn item_info(&self, item_id: &str, kind: NotificationKind, message: impl Into<String>) {
        self.send(&Notification::for_item(kind, item_id, message)).await;
    }

    pub fn tracked_handles(&self, item_id: &str) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pipeline_core::{PipelineError, PipelineResult};

    use super::*;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        retracted: Mutex<Vec<NotificationHandle>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            notification: &Notification,
        ) -> PipelineResult<Option<NotificationHandle>> {
            if self.fail {
                return Err(PipelineError::Network("连接被拒绝".to_string()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(notification.clone());
            Ok(Some(NotificationHandle(format!("msg-{}", sent.len()))))
        }

        async fn retract(&self, handle: &NotificationHandle) -> PipelineResult<()> {
            self.retracted.lock().unwrap().push(handle.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn progress_supersedes_previous_progress() {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifier = ProgressNotifier::new(recorder.clone());

        notifier.progress("a", "下载中").await;
        notifier.progress("a", "已下载").await;
        assert_eq!(notifier.tracked_handles("a"), 1);
        assert_eq!(
            *recorder.retracted.lock().unwrap(),
            vec![NotificationHandle("msg-1".to_string())]
        );

        notifier
            .terminal("a", NotificationKind::Completed, "已完成")
            .await;
        assert_eq!(notifier.tracked_handles("a"), 0);
        assert_eq!(recorder.retracted.lock().unwrap().len(), 2);
        assert_eq!(recorder.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let recorder = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let notifier = ProgressNotifier::new(recorder);
        notifier.progress("a", "下载中").await;
        notifier
            .broadcast(NotificationKind::Summary, "日报")
            .await;
        assert_eq!(notifier.tracked_handles("a"), 0);
    }
}
