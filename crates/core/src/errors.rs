use thiserror::Error;

/// 流水线错误类型定义
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储操作错误: {0}")]
    Storage(String),

    #[error("条目未找到: {id}")]
    ItemNotFound { id: String },

    #[error("工作身份未找到: {name}")]
    IdentityNotFound { name: String },

    #[error("没有可用的工作身份")]
    NoIdentityAvailable,

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("条目 {id} 当前状态 {state} 不允许该操作")]
    InvalidState { id: String, state: String },

    #[error("条目 {id} 已用完重试次数 ({attempts})")]
    RetryBudgetExhausted { id: String, attempts: u32 },

    #[error("条目已放弃: {id}")]
    ItemAbandoned { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// 存储不可用属于致命错误，需要上报到调度器的顶层错误通知
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Database(_) | PipelineError::Storage(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_fatal() {
        assert!(PipelineError::Storage("磁盘已满".to_string()).is_fatal());
        assert!(!PipelineError::NoIdentityAvailable.is_fatal());
        assert!(!PipelineError::Network("连接超时".to_string()).is_fatal());
    }

    #[test]
    fn error_messages_include_context() {
        let err = PipelineError::InvalidState {
            id: "item-1".to_string(),
            state: "uploading".to_string(),
        };
        assert_eq!(err.to_string(), "条目 item-1 当前状态 uploading 不允许该操作");

        let err: PipelineError = serde_json::from_str::<u32>("oops").unwrap_err().into();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
