use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorClass, StageError};

/// 条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Discovered,
    Downloading,
    Downloaded,
    Uploading,
    Completed,
    Failed,
    Abandoned,
}

impl ItemState {
    pub const ALL: [ItemState; 7] = [
        ItemState::Discovered,
        ItemState::Downloading,
        ItemState::Downloaded,
        ItemState::Uploading,
        ItemState::Completed,
        ItemState::Failed,
        ItemState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Discovered => "discovered",
            ItemState::Downloading => "downloading",
            ItemState::Downloaded => "downloaded",
            ItemState::Uploading => "uploading",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Abandoned => "abandoned",
        }
    }

    /// 吸收态，进入后不再变化
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Abandoned)
    }

    /// 正在被某个阶段处理
    pub fn is_active(&self) -> bool {
        matches!(self, ItemState::Downloading | ItemState::Uploading)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("未知的条目状态: {s}"))
    }
}

/// 最近一次失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&StageError> for ItemError {
    fn from(err: &StageError) -> Self {
        Self {
            class: err.class,
            message: err.message.clone(),
        }
    }
}

/// 来源列举出的新条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub destination: Option<String>,
}

/// 流水线中被跟踪的条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub destination: Option<String>,
    pub state: ItemState,
    /// 当前阶段的失败次数，阶段成功后清零
    pub attempt_count: u32,
    pub last_error: Option<ItemError>,
    pub local_ref: Option<String>,
    pub remote_ref: Option<String>,
    /// 下载被策略跳过，上传阶段按合成成功处理
    pub skipped: bool,
    /// 退避到期前各阶段不会处理该条目
    pub next_retry_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn from_draft(draft: &ItemDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: draft.id.clone(),
            source_id: draft.source_id.clone(),
            title: draft.title.clone(),
            url: draft.url.clone(),
            description: draft.description.clone(),
            destination: draft.destination.clone(),
            state: ItemState::Discovered,
            attempt_count: 0,
            last_error: None,
            local_ref: None,
            remote_ref: None,
            skipped: false,
            next_retry_at: None,
            discovered_at: now,
            updated_at: now,
        }
    }

    /// 失败后的重新入口：已有本地产物则跳过重新下载
    pub fn reentry_state(&self) -> ItemState {
        if self.local_ref.is_some() || self.skipped {
            ItemState::Downloaded
        } else {
            ItemState::Discovered
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

/// 可空字段的三态更新
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> FieldUpdate<T> {
    pub fn apply(&self, target: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *target = Some(value.clone()),
            FieldUpdate::Clear => *target = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }
}

/// 与状态转换一起原子写入的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub attempt_count: Option<u32>,
    pub last_error: FieldUpdate<ItemError>,
    pub local_ref: FieldUpdate<String>,
    pub remote_ref: FieldUpdate<String>,
    pub skipped: Option<bool>,
    pub next_retry_at: FieldUpdate<DateTime<Utc>>,
}

impl ItemUpdate {
    /// 阶段成功：清零尝试次数、错误和退避
    pub fn stage_success() -> Self {
        Self {
            attempt_count: Some(0),
            last_error: FieldUpdate::Clear,
            next_retry_at: FieldUpdate::Clear,
            ..Default::default()
        }
    }

    pub fn failure(attempt_count: u32, error: &StageError) -> Self {
        Self {
            attempt_count: Some(attempt_count),
            last_error: FieldUpdate::Set(error.into()),
            ..Default::default()
        }
    }

    pub fn with_local_ref(mut self, local_ref: FieldUpdate<String>) -> Self {
        self.local_ref = local_ref;
        self
    }

    pub fn with_remote_ref(mut self, remote_ref: FieldUpdate<String>) -> Self {
        self.remote_ref = remote_ref;
        self
    }

    pub fn with_skipped(mut self, skipped: bool) -> Self {
        self.skipped = Some(skipped);
        self
    }

    pub fn with_next_retry_at(mut self, next_retry_at: FieldUpdate<DateTime<Utc>>) -> Self {
        self.next_retry_at = next_retry_at;
        self
    }

    pub fn apply_to(&self, item: &mut Item) {
        if let Some(attempt_count) = self.attempt_count {
            item.attempt_count = attempt_count;
        }
        self.last_error.apply(&mut item.last_error);
        self.local_ref.apply(&mut item.local_ref);
        self.remote_ref.apply(&mut item.remote_ref);
        if let Some(skipped) = self.skipped {
            item.skipped = skipped;
        }
        self.next_retry_at.apply(&mut item.next_retry_at);
    }
}

/// 工作身份（账号、凭据或连接）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub name: String,
    pub credentials: Option<String>,
    pub is_enabled: bool,
    /// 自上次成功以来的连续失败次数
    pub failure_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// 指数加权成功率，取值 [0, 1]
    pub success_rate: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    /// 认证失败后，重新选用前需要先刷新会话
    pub needs_session_refresh: bool,
}

impl WorkerIdentity {
    pub fn new(name: impl Into<String>, credentials: Option<String>) -> Self {
        Self {
            name: name.into(),
            credentials,
            is_enabled: true,
            failure_count: 0,
            cooldown_until: None,
            success_rate: 1.0,
            last_used_at: None,
            total_requests: 0,
            needs_session_refresh: false,
        }
    }

    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && !self.is_cooling(now)
    }

    pub fn since_last_used(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_used_at.map(|at| now - at)
    }
}

/// 各状态的条目数量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    counts: BTreeMap<ItemState, u64>,
}

impl StateCounts {
    pub fn set(&mut self, state: ItemState, count: u64) {
        self.counts.insert(state, count);
    }

    pub fn increment(&mut self, state: ItemState) {
        *self.counts.entry(state).or_insert(0) += 1;
    }

    pub fn get(&self, state: ItemState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn pending(&self) -> u64 {
        self.get(ItemState::Discovered) + self.get(ItemState::Downloaded)
    }
}

impl fmt::Display for StateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = ItemState::ALL
            .iter()
            .map(|state| format!("{}={}", state, self.get(*state)))
            .collect();
        write!(f, "{} (共 {})", parts.join(", "), self.total())
    }
}

/// 身份健康状况快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityHealth {
    pub name: String,
    pub is_enabled: bool,
    pub cooling: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub success_rate: f64,
    pub total_requests: u64,
    pub needs_session_refresh: bool,
}

impl IdentityHealth {
    pub fn from_identity(identity: &WorkerIdentity, now: DateTime<Utc>) -> Self {
        Self {
            name: identity.name.clone(),
            is_enabled: identity.is_enabled,
            cooling: identity.is_cooling(now),
            cooldown_until: identity.cooldown_until,
            failure_count: identity.failure_count,
            success_rate: identity.success_rate,
            total_requests: identity.total_requests,
            needs_session_refresh: identity.needs_session_refresh,
        }
    }
}

/// 流水线状态摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub scheduler_state: String,
    pub counts: StateCounts,
    pub identities: Vec<IdentityHealth>,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "调度器状态: {}", self.scheduler_state)?;
        writeln!(f, "条目统计: {}", self.counts)?;
        let active = self
            .identities
            .iter()
            .filter(|i| i.is_enabled && !i.cooling)
            .count();
        let cooling = self.identities.iter().filter(|i| i.cooling).count();
        let disabled = self.identities.iter().filter(|i| !i.is_enabled).count();
        write!(
            f,
            "工作身份: 可用 {active}, 冷却中 {cooling}, 已禁用 {disabled}"
        )?;
        for identity in &self.identities {
            write!(
                f,
                "\n  - {} 成功率 {:.2} 连续失败 {} 请求数 {}{}{}",
                identity.name,
                identity.success_rate,
                identity.failure_count,
                identity.total_requests,
                if identity.cooling { " [冷却中]" } else { "" },
                if identity.is_enabled { "" } else { " [已禁用]" },
            )?;
        }
        Ok(())
    }
}
