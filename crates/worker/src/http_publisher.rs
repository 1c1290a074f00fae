//! 上传到文件服务器

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::config::PublisherConfig;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{ErrorClass, Publisher, StageError};
use serde::Deserialize;
use tracing::{debug, info};

use crate::classify::{classify_http_status, classify_message, classify_reqwest_error};

#[derive(Debug, Deserialize)]
struct PutResponse {
    code: u16,
    #[serde(default)]
    message: String,
}

/// 以 `PUT /api/fs/put` 上传文件，目标路径放在 `File-Path` 请求头中
pub struct HttpPublisher {
    config: PublisherConfig,
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(config: PublisherConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { config, client })
    }

    fn remote_path(destination: &str, local_ref: &str) -> Result<String, StageError> {
        let file_name = Path::new(local_ref)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StageError::unknown(format!("无效的本地文件路径: {local_ref}")))?;
        let destination = destination.trim_matches('/');
        if destination.is_empty() {
            Ok(format!("/{file_name}"))
        } else {
            Ok(format!("/{destination}/{file_name}"))
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, local_ref: &str, destination: &str) -> Result<String, StageError> {
        let remote_path = Self::remote_path(destination, local_ref)?;
        let body = tokio::fs::read(local_ref).await.map_err(|e| {
            StageError::new(ErrorClass::NotFound, format!("读取本地文件失败: {e}"))
        })?;
        let size = body.len();

        let base_url = self.config.base_url.trim_end_matches('/');
        let mut request = self
            .client
            .put(format!("{base_url}/api/fs/put"))
            .header("File-Path", &remote_path)
            .header("Content-Type", "application/octet-stream")
            .body(body);
        if let Some(token) = &self.config.auth_token {
            request = request.header("Authorization", token);
        }

        debug!(remote_path = %remote_path, size, "开始上传");
        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StageError::new(
                classify_http_status(status.as_u16()),
                format!("HTTP {status}: {text}"),
            ));
        }

        let reply: PutResponse = response
            .json()
            .await
            .map_err(|e| StageError::unknown(format!("解析上传响应失败: {e}")))?;
        if reply.code != 200 {
            let class = match classify_http_status(reply.code) {
                ErrorClass::Unknown => classify_message(&reply.message),
                class => class,
            };
            return Err(StageError::new(class, format!("上传失败: {}", reply.message)));
        }

        let remote_ref = format!("{base_url}{remote_path}");
        info!(remote_ref = %remote_ref, size, "上传完成");
        Ok(remote_ref)
    }
}
