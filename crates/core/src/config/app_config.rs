use std::collections::HashSet;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::sections::{
    DatabaseConfig, FetcherConfig, IdentityConfig, NotifierConfig, ObservabilityConfig,
    PublisherConfig, RetryConfig, SchedulerConfig, SourceConfig, StageConfig, WorkerPoolConfig,
};

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub worker_pool: WorkerPoolConfig,
    pub stages: StageConfig,
    pub sources: Vec<SourceConfig>,
    pub identities: Vec<IdentityConfig>,
    pub fetcher: FetcherConfig,
    pub publisher: PublisherConfig,
    pub notifier: NotifierConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：内置默认值 < TOML 文件 < PIPELINE_ 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?,
        );

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/pipeline.toml",
                "pipeline.toml",
                "/etc/pipeline/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PIPELINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化TOML配置失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置无效")?;
        self.scheduler.validate().context("调度器配置无效")?;
        self.retry.validate().context("重试配置无效")?;
        self.worker_pool.validate().context("身份池配置无效")?;
        self.stages.validate().context("阶段配置无效")?;
        self.fetcher.validate().context("下载配置无效")?;
        self.publisher.validate().context("上传配置无效")?;
        self.observability.validate().context("日志配置无效")?;

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            ensure!(!source.id.is_empty(), "来源ID不能为空");
            ensure!(source_ids.insert(&source.id), "来源ID重复: {}", source.id);
        }
        let mut names = HashSet::new();
        for identity in &self.identities {
            ensure!(!identity.name.is_empty(), "身份名称不能为空");
            ensure!(names.insert(&identity.name), "身份名称重复: {}", identity.name);
        }
        Ok(())
    }
}
