//! 从 JSON 列表接口获取来源的新条目

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pipeline_core::config::SourceConfig;
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{ErrorClass, ItemDraft, SourceLister, StageError};
use serde::Deserialize;
use tracing::debug;

use crate::classify::{classify_http_status, classify_reqwest_error};

#[derive(Debug, Deserialize)]
struct FeedEntry {
    id: String,
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub struct FeedSourceLister {
    sources: Vec<SourceConfig>,
    client: reqwest::Client,
}

impl FeedSourceLister {
    pub fn new(sources: Vec<SourceConfig>, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { sources, client })
    }

    fn to_draft(source: &SourceConfig, entry: FeedEntry) -> ItemDraft {
        ItemDraft {
            id: entry.id,
            source_id: source.id.clone(),
            title: entry.title,
            url: entry.url,
            description: entry.description,
            destination: source.destination.clone(),
        }
    }
}

#[async_trait]
impl SourceLister for FeedSourceLister {
    fn sources(&self) -> Vec<String> {
        self.sources.iter().map(|source| source.id.clone()).collect()
    }

    async fn list_new_items(
        &self,
        source_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemDraft>, StageError> {
        let source = self
            .sources
            .iter()
            .find(|source| source.id == source_id)
            .ok_or_else(|| StageError::new(ErrorClass::NotFound, format!("未知的来源: {source_id}")))?;

        let mut request = self.client.get(&source.url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }

        let response = request.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::new(
                classify_http_status(status.as_u16()),
                format!("HTTP {status}"),
            ));
        }

        let entries: Vec<FeedEntry> = response
            .json()
            .await
            .map_err(|e| StageError::unknown(format!("解析来源列表失败: {e}")))?;
        debug!(source_id, count = entries.len(), "来源列表已获取");

        Ok(entries
            .into_iter()
            .map(|entry| Self::to_draft(source, entry))
            .collect())
    }
}
