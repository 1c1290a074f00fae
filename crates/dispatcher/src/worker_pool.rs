//! 工作身份池
//!
//! 跟踪每个身份的健康度和负载，每次请求选出得分最高的可用身份。
//! 冷却中或已禁用的身份永远不会被选中。

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use pipeline_core::clock::chrono_duration;
use pipeline_core::config::WorkerPoolConfig;
use pipeline_core::{Clock, PipelineError, PipelineResult};
use pipeline_domain::{Escalation, IdentityHealth, IdentityRepository, WorkerIdentity};
use rand::Rng;
use tracing::{debug, info, warn};

/// 距上次使用时间的权重
pub const RECENCY_WEIGHT: f64 = 0.4;
/// 成功率权重
pub const SUCCESS_WEIGHT: f64 = 0.4;
/// 低负载权重
pub const LOAD_WEIGHT: f64 = 0.2;
/// 成功后成功率的衰减系数
pub const SUCCESS_RATE_DECAY: f64 = 0.9;
/// 失败后成功率的惩罚系数
pub const FAILURE_PENALTY: f64 = 0.8;

pub struct WorkerPool {
    identities: Mutex<Vec<WorkerIdentity>>,
    config: WorkerPoolConfig,
    clock: Arc<dyn Clock>,
    repository: Option<Arc<dyn IdentityRepository>>,
}

impl WorkerPool {
    pub fn new(
        identities: Vec<WorkerIdentity>,
        config: WorkerPoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identities: Mutex::new(identities),
            config,
            clock,
            repository: None,
        }
    }

    /// 健康状态变化后尽力写回仓储
    pub fn with_repository(mut self, repository: Arc<dyn IdentityRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerIdentity>> {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 不含随机抖动的基础得分
    pub fn score(&self, identity: &WorkerIdentity, now: DateTime<Utc>) -> f64 {
        let recency = match identity.since_last_used(now) {
            None => 1.0,
            Some(elapsed) => {
                let full = (self.config.min_request_interval_seconds * 2) as f64;
                (elapsed.num_seconds().max(0) as f64 / full).min(1.0)
            }
        };
        let load =
            (1.0 - identity.total_requests as f64 / (2.0 * self.config.load_normalizer)).max(0.0);

        RECENCY_WEIGHT * recency
            + SUCCESS_WEIGHT * identity.success_rate.clamp(0.0, 1.0)
            + LOAD_WEIGHT * load
    }

    fn jitter(&self, rng: &mut impl Rng) -> f64 {
        if self.config.jitter_min >= self.config.jitter_max {
            return self.config.jitter_min;
        }
        rng.random_range(self.config.jitter_min..=self.config.jitter_max)
    }

    /// 选出当前得分最高的可用身份，并记录一次使用
    pub fn select(&self) -> PipelineResult<WorkerIdentity> {
        let now = self.clock.now();
        let mut rng = rand::rng();
        let mut identities = self.lock();

        let scored: Vec<(usize, f64)> = identities
            .iter()
            .enumerate()
            .filter(|(_, identity)| identity.is_available(now))
            .map(|(index, identity)| (index, self.score(identity, now) * self.jitter(&mut rng)))
            .collect();

        let Some((index, score)) = scored
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        else {
            metrics::counter!("identity_selection_failures_total").increment(1);
            warn!("所有工作身份都在冷却或已禁用");
            return Err(PipelineError::NoIdentityAvailable);
        };

        let identity = &mut identities[index];
        identity.last_used_at = Some(now);
        identity.total_requests += 1;
        debug!(identity = %identity.name, score, "选择工作身份");
        Ok(identity.clone())
    }

    pub async fn record_success(&self, name: &str) {
        let snapshot = self.update(name, |identity, _| {
            identity.failure_count = identity.failure_count.saturating_sub(1);
            identity.success_rate = identity.success_rate * SUCCESS_RATE_DECAY + (1.0 - SUCCESS_RATE_DECAY);
        });
        self.persist(snapshot).await;
    }

    /// 根据升级动作降级身份：轮换身份或连续失败达到阈值时进入冷却，
    /// 认证失败使用认证冷却期并要求刷新会话
    pub async fn record_failure(&self, name: &str, escalation: Escalation) {
        let threshold = self.config.failure_threshold;
        let cooldown = chrono_duration(self.config.cooldown());
        let auth_cooldown = chrono_duration(self.config.auth_cooldown());

        let snapshot = self.update(name, |identity, now| {
            identity.failure_count += 1;
            identity.success_rate *= FAILURE_PENALTY;

            let cooldown_until = match escalation {
                Escalation::RotateSession => {
                    identity.needs_session_refresh = true;
                    Some(now + auth_cooldown)
                }
                Escalation::RotateIdentity => Some(now + cooldown),
                Escalation::None if identity.failure_count >= threshold => Some(now + cooldown),
                Escalation::None => None,
            };
            if let Some(until) = cooldown_until {
                identity.cooldown_until = Some(until);
                warn!(
                    identity = %identity.name,
                    failure_count = identity.failure_count,
                    cooldown_until = %until,
                    "工作身份进入冷却"
                );
            }
        });
        self.persist(snapshot).await;
    }

    pub async fn mark_session_refreshed(&self, name: &str) {
        let snapshot = self.update(name, |identity, _| {
            identity.needs_session_refresh = false;
        });
        self.persist(snapshot).await;
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> PipelineResult<()> {
        let snapshot = self
            .update(name, |identity, _| identity.is_enabled = enabled)
            .ok_or_else(|| PipelineError::IdentityNotFound {
                name: name.to_string(),
            })?;
        info!(identity = name, enabled, "更新工作身份启用状态");

        if let Some(repository) = &self.repository {
            repository.save_identity(&snapshot).await?;
        }
        Ok(())
    }

    pub fn health(&self) -> Vec<IdentityHealth> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .map(|identity| IdentityHealth::from_identity(identity, now))
            .collect()
    }

    pub fn identities(&self) -> Vec<WorkerIdentity> {
        self.lock().clone()
    }

    pub fn available_count(&self) -> usize {
        let now = self.clock.now();
        self.lock().iter().filter(|i| i.is_available(now)).count()
    }

    fn update<F>(&self, name: &str, apply: F) -> Option<WorkerIdentity>
    where
        F: FnOnce(&mut WorkerIdentity, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut identities = self.lock();
        match identities.iter_mut().find(|identity| identity.name == name) {
            Some(identity) => {
                apply(identity, now);
                Some(identity.clone())
            }
            None => {
                warn!(identity = name, "工作身份不存在");
                None
            }
        }
    }

    async fn persist(&self, snapshot: Option<WorkerIdentity>) {
        let (Some(repository), Some(identity)) = (&self.repository, snapshot) else {
            return;
        };
        if let Err(e) = repository.save_health(&identity).await {
            warn!(identity = %identity.name, "保存工作身份健康状态失败: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pipeline_core::ManualClock;

    use super::*;

    fn pool(names: &[&str], clock: &ManualClock) -> WorkerPool {
        let config = WorkerPoolConfig {
            jitter_min: 1.0,
            jitter_max: 1.0,
            ..Default::default()
        };
        let identities = names
            .iter()
            .map(|name| WorkerIdentity::new(*name, None))
            .collect();
        WorkerPool::new(identities, config, Arc::new(clock.clone()))
    }

    #[test]
    fn fresh_identity_scores_maximum() {
        let clock = ManualClock::default();
        let pool = pool(&["a"], &clock);
        let identity = WorkerIdentity::new("a", None);
        let score = pool.score(&identity, clock.now());
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn recently_used_identity_is_deprioritized() {
        let clock = ManualClock::default();
        let pool = pool(&["a", "b"], &clock);

        let first = pool.select().unwrap();
        let second = pool.select().unwrap();
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn success_decays_failure_count() {
        let clock = ManualClock::default();
        let pool = pool(&["a"], &clock);

        pool.record_failure("a", Escalation::None).await;
        pool.record_failure("a", Escalation::None).await;
        pool.record_success("a").await;

        let identity = &pool.identities()[0];
        assert_eq!(identity.failure_count, 1);
        let expected = 1.0 * 0.8 * 0.8 * 0.9 + 0.1;
        assert!((identity.success_rate - expected).abs() < 1e-9);
        assert!(identity.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn authentication_failure_requires_session_refresh() {
        let clock = ManualClock::default();
        let pool = pool(&["a"], &clock);

        pool.record_failure("a", Escalation::RotateSession).await;
        let identity = &pool.identities()[0];
        assert!(identity.needs_session_refresh);
        assert_eq!(
            identity.cooldown_until,
            Some(clock.now() + chrono::Duration::seconds(1800))
        );
        assert!(pool.select().is_err());

        clock.advance(Duration::from_secs(1801));
        assert_eq!(pool.select().unwrap().name, "a");
        pool.mark_session_refreshed("a").await;
        assert!(!pool.identities()[0].needs_session_refresh);
    }

    #[tokio::test]
    async fn unknown_identity_cannot_be_toggled() {
        let clock = ManualClock::default();
        let pool = pool(&["a"], &clock);
        assert!(matches!(
            pool.set_enabled("missing", false).await,
            Err(PipelineError::IdentityNotFound { .. })
        ));
    }
}
