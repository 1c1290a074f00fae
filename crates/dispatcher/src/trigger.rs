use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 排空触发器：正在排空时再次触发是无操作
#[derive(Debug)]
pub struct StageTrigger {
    name: &'static str,
    draining: AtomicBool,
    passes: AtomicU64,
}

impl StageTrigger {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            draining: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 成功标记为排空中才返回守卫
    pub fn try_begin(&self) -> Option<DrainGuard<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.passes.fetch_add(1, Ordering::Relaxed);
        Some(DrainGuard { trigger: self })
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// 已开始的排空轮数
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

pub struct DrainGuard<'a> {
    trigger: &'a StageTrigger,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.trigger.draining.store(false, Ordering::Release);
    }
}
