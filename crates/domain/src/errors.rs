//! 阶段失败分类
//!
//! 外部协作方（下载、上传、来源列举）返回的错误都必须带上一个分类标签，
//! 重试策略只根据分类做判断。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    RateLimited,
    AuthenticationFailed,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 7] = [
        ErrorClass::TransientNetwork,
        ErrorClass::NotFound,
        ErrorClass::PermissionDenied,
        ErrorClass::QuotaExceeded,
        ErrorClass::RateLimited,
        ErrorClass::AuthenticationFailed,
        ErrorClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::NotFound => "not_found",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::AuthenticationFailed => "authentication_failed",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// 是否属于条目本身的问题，与所用身份无关
    pub fn is_item_specific(&self) -> bool {
        matches!(self, ErrorClass::NotFound | ErrorClass::PermissionDenied)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("未知的错误分类: {s}"))
    }
}

/// 阶段操作失败，携带分类和描述
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{class}] {message}")]
pub struct StageError {
    pub class: ErrorClass,
    pub message: String,
}

impl StageError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TransientNetwork, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, message)
    }
}
