//! 流水线事件
//!
//! 事件只存在于事件总线队列中，不做持久化。处理器收到事件后总是重新查询存储，
//! 事件内容只用于决定唤醒哪个阶段。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件内容（封闭集合）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ItemsDiscovered { source_id: String, count: usize },
    DownloadCompleted { item_id: String },
    UploadCompleted { item_id: String },
    AuxDownloadNeeded { item_id: String },
    AuxDownloadCompleted {
        item_id: String,
        fetched: usize,
        failed: usize,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::ItemsDiscovered { .. } => "items_discovered",
            EventPayload::DownloadCompleted { .. } => "download_completed",
            EventPayload::UploadCompleted { .. } => "upload_completed",
            EventPayload::AuxDownloadNeeded { .. } => "aux_download_needed",
            EventPayload::AuxDownloadCompleted { .. } => "aux_download_completed",
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            EventPayload::ItemsDiscovered { .. } => None,
            EventPayload::DownloadCompleted { item_id }
            | EventPayload::UploadCompleted { item_id }
            | EventPayload::AuxDownloadNeeded { item_id }
            | EventPayload::AuxDownloadCompleted { item_id, .. } => Some(item_id),
        }
    }
}

/// 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
