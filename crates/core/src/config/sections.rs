use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://pipeline.db?mode=rwc".to_string(),
            max_connections: 5,
            connection_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.url.is_empty(), "数据库URL不能为空");
        ensure!(self.max_connections > 0, "最大连接数必须大于0");
        Ok(())
    }
}

/// 调度器定时任务配置，单位均为秒
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: u64,
    pub download_sweep_interval_seconds: u64,
    pub upload_sweep_interval_seconds: u64,
    pub retry_sweep_interval_seconds: u64,
    pub stuck_sweep_interval_seconds: u64,
    pub stuck_threshold_seconds: u64,
    pub daily_summary_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub event_wait_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    /// 两个来源之间的轮询间隔（毫秒）
    pub source_poll_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 3600,
            download_sweep_interval_seconds: 600,
            upload_sweep_interval_seconds: 600,
            retry_sweep_interval_seconds: 7200,
            stuck_sweep_interval_seconds: 900,
            stuck_threshold_seconds: 3600,
            daily_summary_interval_seconds: 86400,
            cleanup_interval_seconds: 21600,
            event_wait_timeout_seconds: 10,
            shutdown_timeout_seconds: 30,
            source_poll_delay_ms: 2000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("download_sweep_interval_seconds", self.download_sweep_interval_seconds),
            ("upload_sweep_interval_seconds", self.upload_sweep_interval_seconds),
            ("retry_sweep_interval_seconds", self.retry_sweep_interval_seconds),
            ("stuck_sweep_interval_seconds", self.stuck_sweep_interval_seconds),
            ("daily_summary_interval_seconds", self.daily_summary_interval_seconds),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("event_wait_timeout_seconds", self.event_wait_timeout_seconds),
        ];
        for (name, value) in intervals {
            ensure!(value > 0, "{name} 必须大于0");
        }
        ensure!(
            self.stuck_threshold_seconds > 0,
            "stuck_threshold_seconds 必须大于0"
        );
        Ok(())
    }

    pub fn event_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.event_wait_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// 重试预算配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 每个阶段允许的最大尝试次数，达到后条目进入 Abandoned
    pub max_attempts: u32,
    /// 不超过该等待时长的重试在处理器内原地等待，更长的等待改为延后重新入队
    pub inline_retry_max_wait_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            inline_retry_max_wait_seconds: 60,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_attempts > 0, "最大尝试次数必须大于0");
        Ok(())
    }

    pub fn inline_retry_max_wait(&self) -> Duration {
        Duration::from_secs(self.inline_retry_max_wait_seconds)
    }
}

/// 工作身份池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    pub auth_cooldown_seconds: u64,
    /// 距离上次使用达到该间隔的两倍时，时间得分取满分
    pub min_request_interval_seconds: u64,
    /// 负载归一化基数（请求次数）
    pub load_normalizer: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_seconds: 3600,
            auth_cooldown_seconds: 1800,
            min_request_interval_seconds: 300,
            load_normalizer: 100.0,
            jitter_min: 0.9,
            jitter_max: 1.1,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.failure_threshold > 0, "失败阈值必须大于0");
        ensure!(self.min_request_interval_seconds > 0, "最小请求间隔必须大于0");
        ensure!(self.load_normalizer > 0.0, "负载归一化基数必须大于0");
        ensure!(
            self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max,
            "抖动区间无效: [{}, {}]",
            self.jitter_min,
            self.jitter_max
        );
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_secs(self.auth_cooldown_seconds)
    }
}

/// 各阶段并发容量
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub download_capacity: usize,
    pub upload_capacity: usize,
    pub aux_capacity: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            download_capacity: 3,
            upload_capacity: 2,
            aux_capacity: 2,
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.download_capacity > 0, "下载并发数必须大于0");
        ensure!(self.upload_capacity > 0, "上传并发数必须大于0");
        ensure!(self.aux_capacity > 0, "附件下载并发数必须大于0");
        Ok(())
    }
}

/// 内容来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    /// 该来源条目的上传目标
    #[serde(default)]
    pub destination: Option<String>,
}

/// 工作身份（账号/凭据）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    pub name: String,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// 下载命令配置，参数支持 {url} {id} {output_dir} {identity} {credentials} 占位符
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub program: String,
    pub args: Vec<String>,
    pub session_refresh_args: Vec<String>,
    pub output_dir: String,
    pub timeout_seconds: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            args: vec![
                "--no-progress".to_string(),
                "--cookies".to_string(),
                "{credentials}".to_string(),
                "-o".to_string(),
                "{output_dir}/{id}.%(ext)s".to_string(),
                "--print".to_string(),
                "after_move:filepath".to_string(),
                "{url}".to_string(),
            ],
            session_refresh_args: Vec::new(),
            output_dir: "downloads".to_string(),
            timeout_seconds: 1800,
        }
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.program.is_empty(), "下载程序不能为空");
        ensure!(self.timeout_seconds > 0, "下载超时必须大于0");
        Ok(())
    }
}

/// 上传目标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub base_url: String,
    pub default_destination: String,
    pub auth_token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            default_destination: "inbox".to_string(),
            auth_token: None,
            timeout_seconds: 600,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.base_url.is_empty(), "上传地址不能为空");
        ensure!(self.timeout_seconds > 0, "上传超时必须大于0");
        Ok(())
    }
}

/// 通知配置，未设置 webhook 时只写日志
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_seconds: 10,
        }
    }
}

/// 日志与指标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_bind_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_bind_address: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            ["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()),
            "不支持的日志级别: {}",
            self.log_level
        );
        ensure!(
            ["json", "pretty"].contains(&self.log_format.as_str()),
            "不支持的日志格式: {}",
            self.log_format
        );
        Ok(())
    }
}
