//! 重试策略
//!
//! 纯函数：只根据错误分类和尝试序号判断是否重试、等待多久、是否需要轮换身份。
//! 尝试次数预算由调用方负责。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorClass;

/// 瞬时错误的最长等待
pub const TRANSIENT_MAX_WAIT: Duration = Duration::from_secs(60);
/// 限流的最短等待
pub const RATE_LIMITED_MIN_WAIT: Duration = Duration::from_secs(600);
/// 认证失败的最短等待
pub const AUTHENTICATION_MIN_WAIT: Duration = Duration::from_secs(1800);
/// 平台配额耗尽的最短等待
pub const QUOTA_MIN_WAIT: Duration = Duration::from_secs(3600);
/// 指数退避上限
pub const BACKOFF_CAP: Duration = Duration::from_secs(6 * 3600);

/// 失败后需要采取的升级动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    None,
    RotateIdentity,
    RotateSession,
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub wait: Duration,
    pub escalate: Escalation,
}

impl RetryDecision {
    fn retry(wait: Duration, escalate: Escalation) -> Self {
        Self {
            should_retry: true,
            wait,
            escalate,
        }
    }

    fn give_up() -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
            escalate: Escalation::None,
        }
    }
}

/// 指数退避 `2^attempt` 秒，封顶 [`BACKOFF_CAP`]
pub fn exponential_backoff(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

/// 根据错误分类和尝试序号（从0开始）给出重试决策
pub fn decide(class: ErrorClass, attempt: u32) -> RetryDecision {
    let backoff = exponential_backoff(attempt);
    match class {
        ErrorClass::TransientNetwork | ErrorClass::Unknown => {
            RetryDecision::retry(backoff.min(TRANSIENT_MAX_WAIT), Escalation::None)
        }
        ErrorClass::RateLimited => {
            RetryDecision::retry(backoff.max(RATE_LIMITED_MIN_WAIT), Escalation::RotateIdentity)
        }
        ErrorClass::AuthenticationFailed => RetryDecision::retry(
            backoff.max(AUTHENTICATION_MIN_WAIT),
            Escalation::RotateSession,
        ),
        // 平台级配额，换身份也没有用
        ErrorClass::QuotaExceeded => {
            RetryDecision::retry(backoff.max(QUOTA_MIN_WAIT), Escalation::None)
        }
        ErrorClass::NotFound | ErrorClass::PermissionDenied => RetryDecision::give_up(),
    }
}
