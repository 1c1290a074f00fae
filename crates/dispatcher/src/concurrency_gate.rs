//! 并发闸门
//!
//! 每个阶段一个计数信号量，阶段之间互不影响；另外维护进程内的条目锁，
//! 保证同一条目同一时刻最多只有一个处理任务。许可在离开作用域时释放。

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use pipeline_core::config::StageConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Upload,
    /// 附件链接下载
    Aux,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Aux => "aux",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ActiveItems = Arc<Mutex<HashSet<String>>>;

/// 条目锁，释放时从活动集合移除
#[derive(Debug)]
pub struct ItemLock {
    item_id: String,
    active: ActiveItems,
}

impl Drop for ItemLock {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.item_id);
    }
}

/// 阶段许可加条目锁
#[derive(Debug)]
pub struct GatePermit {
    _slot: OwnedSemaphorePermit,
    _lock: ItemLock,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    download: Arc<Semaphore>,
    upload: Arc<Semaphore>,
    aux: Arc<Semaphore>,
    active: ActiveItems,
}

impl ConcurrencyGate {
    pub fn new(config: &StageConfig) -> Self {
        Self {
            download: Arc::new(Semaphore::new(config.download_capacity)),
            upload: Arc::new(Semaphore::new(config.upload_capacity)),
            aux: Arc::new(Semaphore::new(config.aux_capacity)),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn semaphore(&self, stage: Stage) -> &Arc<Semaphore> {
        match stage {
            Stage::Download => &self.download,
            Stage::Upload => &self.upload,
            Stage::Aux => &self.aux,
        }
    }

    /// 非阻塞地获取条目锁；条目正在被处理时返回 None
    pub fn try_lock_item(&self, item_id: &str) -> Option<ItemLock> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(item_id.to_string()) {
            return None;
        }
        Some(ItemLock {
            item_id: item_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    /// 先占用条目锁，再等待阶段空位。条目已被占用时立即返回 None
    pub async fn acquire(&self, stage: Stage, item_id: &str) -> Option<GatePermit> {
        let Some(lock) = self.try_lock_item(item_id) else {
            debug!(item_id, %stage, "条目正在被处理，跳过");
            return None;
        };
        let slot = self.acquire_slot(stage).await?;
        Some(GatePermit {
            _slot: slot,
            _lock: lock,
        })
    }

    /// 只占用阶段空位，不锁条目（附件下载不改变条目状态）
    pub async fn acquire_slot(&self, stage: Stage) -> Option<OwnedSemaphorePermit> {
        // 信号量只会在关闭时返回错误，这里从不关闭
        Arc::clone(self.semaphore(stage)).acquire_owned().await.ok()
    }

    pub fn is_item_active(&self, item_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(item_id)
    }

    pub fn available(&self, stage: Stage) -> usize {
        self.semaphore(stage).available_permits()
    }
}
