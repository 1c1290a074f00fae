//! 下载条目描述中检测到的附件链接

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{ErrorClass, Item, Link, LinkFetcher, StageError};
use tracing::info;

use crate::classify::{classify_http_status, classify_reqwest_error};

pub struct HttpLinkFetcher {
    output_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpLinkFetcher {
    pub fn new(output_dir: impl Into<PathBuf>, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            output_dir: output_dir.into(),
            client,
        })
    }
}

#[async_trait]
impl LinkFetcher for HttpLinkFetcher {
    async fn fetch_link(&self, item: &Item, link: &Link) -> Result<String, StageError> {
        let Some(url) = link.download_url.as_deref() else {
            return Err(StageError::new(
                ErrorClass::PermissionDenied,
                format!("链接没有直接下载地址: {}", link.url),
            ));
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::new(
                classify_http_status(status.as_u16()),
                format!("HTTP {status}"),
            ));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/html"));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        // 网盘在超限或拒绝访问时返回 HTML 页面而不是文件
        if is_html {
            let page = String::from_utf8_lossy(&bytes).to_lowercase();
            if page.contains("quota exceeded") {
                return Err(StageError::new(ErrorClass::QuotaExceeded, "下载配额已超限"));
            }
            if page.contains("access denied") {
                return Err(StageError::new(ErrorClass::PermissionDenied, "访问被拒绝"));
            }
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| StageError::unknown(format!("创建下载目录失败: {e}")))?;
        let path = self.output_dir.join(format!("{}_{}", item.id, link.file_id));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StageError::unknown(format!("写入附件失败: {e}")))?;

        let local_ref = path.display().to_string();
        info!(item_id = %item.id, file_id = %link.file_id, size = bytes.len(), "附件下载完成");
        Ok(local_ref)
    }
}
