//! 通过外部下载程序获取条目

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_core::config::FetcherConfig;
use pipeline_domain::{FetchOutcome, Fetcher, Item, StageError, WorkerIdentity};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::classify::classify_message;

/// 输出最后一行以此开头时表示按策略跳过
pub const SKIP_MARKER: &str = "SKIP";

struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
    exit_code: Option<i32>,
}

pub struct CommandFetcher {
    config: FetcherConfig,
}

impl CommandFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    /// 替换参数中的占位符。值为空的参数连同前面的选项一起去掉
    fn render_args(&self, templates: &[String], item: Option<&Item>, identity: &WorkerIdentity) -> Vec<String> {
        let credentials = identity.credentials.as_deref().unwrap_or("");
        let mut args: Vec<String> = Vec::with_capacity(templates.len());

        for template in templates {
            let mut arg = template
                .replace("{output_dir}", &self.config.output_dir)
                .replace("{identity}", &identity.name)
                .replace("{credentials}", credentials);
            if let Some(item) = item {
                arg = arg.replace("{url}", &item.url).replace("{id}", &item.id);
            }

            if arg.is_empty() {
                if args.last().is_some_and(|prev| prev.starts_with('-')) {
                    args.pop();
                }
                continue;
            }
            args.push(arg);
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandOutput, StageError> {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        debug!(program = %self.config.program, ?args, "执行下载程序");

        let child = Command::new(&self.config.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::unknown(format!("启动下载程序失败: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(StageError::transient(format!("等待下载程序结束失败: {e}")));
            }
            Err(_) => {
                return Err(StageError::transient(format!(
                    "下载程序超时 ({}秒)",
                    self.config.timeout_seconds
                )));
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            exit_code: output.status.code(),
        })
    }

    fn failure(output: &CommandOutput) -> StageError {
        let detail = output
            .stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string();
        let message = if detail.is_empty() {
            format!("下载程序失败，退出码: {:?}", output.exit_code)
        } else {
            detail
        };
        StageError::new(classify_message(&output.stderr), message)
    }
}

/// 解析下载程序的输出：最后一个非空行是产物路径或跳过标记
fn parse_outcome(stdout: &str) -> Result<FetchOutcome, StageError> {
    let last = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or_else(|| StageError::unknown("下载程序没有输出文件路径"))?;

    if let Some(rest) = last.strip_prefix(SKIP_MARKER) {
        let reason = rest.trim_start_matches(':').trim();
        let reason = if reason.is_empty() { "已跳过" } else { reason };
        return Ok(FetchOutcome::Skipped {
            reason: reason.to_string(),
        });
    }
    Ok(FetchOutcome::Fetched(last.to_string()))
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, item: &Item, identity: &WorkerIdentity) -> Result<FetchOutcome, StageError> {
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| StageError::unknown(format!("创建下载目录失败: {e}")))?;

        let start = Instant::now();
        let args = self.render_args(&self.config.args, Some(item), identity);
        let output = self.run(args).await?;
        if !output.success {
            let err = Self::failure(&output);
            warn!(item_id = %item.id, identity = %identity.name, "下载失败: {err}");
            return Err(err);
        }

        let outcome = parse_outcome(&output.stdout)?;
        if let FetchOutcome::Fetched(path) = &outcome {
            if !Path::new(path).exists() {
                return Err(StageError::unknown(format!("下载文件未找到: {path}")));
            }
        }
        info!(
            item_id = %item.id,
            identity = %identity.name,
            duration_ms = start.elapsed().as_millis() as u64,
            "下载程序执行完成"
        );
        Ok(outcome)
    }

    async fn discard(&self, local_ref: &str) -> Result<(), StageError> {
        match tokio::fs::remove_file(local_ref).await {
            Ok(()) => {
                debug!("已删除本地文件: {local_ref}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StageError::unknown(format!("删除本地文件失败: {e}"))),
        }
    }

    async fn refresh_session(&self, identity: &WorkerIdentity) -> Result<(), StageError> {
        if self.config.session_refresh_args.is_empty() {
            return Ok(());
        }
        let args = self.render_args(&self.config.session_refresh_args, None, identity);
        let output = self.run(args).await?;
        if !output.success {
            return Err(Self::failure(&output));
        }
        info!(identity = %identity.name, "会话已刷新");
        Ok(())
    }
}
