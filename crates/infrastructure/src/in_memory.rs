//! 内存仓储，用于测试和无需持久化的运行方式

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::{PipelineError, PipelineResult};
use pipeline_domain::{
    IdentityRepository, Item, ItemDraft, ItemRepository, ItemState, ItemUpdate, StateCounts,
    WorkerIdentity,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ItemStore {
    items: BTreeMap<String, Item>,
    polls: HashMap<String, DateTime<Utc>>,
    history: Vec<(String, ItemState, ItemState)>,
}

#[derive(Default)]
pub struct InMemoryItemRepository {
    store: Mutex<ItemStore>,
    unavailable: AtomicBool,
}

impl InMemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用，之后的所有操作返回存储错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 直接写入条目，绕过状态检查
    pub fn put(&self, item: Item) {
        lock(&self.store).items.insert(item.id.clone(), item);
    }

    /// 某个条目所有生效过的状态转换，按发生顺序
    pub fn history(&self, id: &str) -> Vec<(ItemState, ItemState)> {
        lock(&self.store)
            .history
            .iter()
            .filter(|(item_id, _, _)| item_id == id)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.store).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Storage("存储不可用".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn insert_if_absent(&self, draft: &ItemDraft, now: DateTime<Utc>) -> PipelineResult<bool> {
        self.check_available()?;
        let mut store = lock(&self.store);
        if store.items.contains_key(&draft.id) {
            return Ok(false);
        }
        store
            .items
            .insert(draft.id.clone(), Item::from_draft(draft, now));
        Ok(true)
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<Item>> {
        self.check_available()?;
        Ok(lock(&self.store).items.get(id).cloned())
    }

    async fn transition_if_state(
        &self,
        id: &str,
        expected: ItemState,
        new_state: ItemState,
        update: &ItemUpdate,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        self.check_available()?;
        let mut guard = lock(&self.store);
        let store = &mut *guard;
        let Some(item) = store.items.get_mut(id) else {
            return Ok(false);
        };
        if item.state != expected {
            return Ok(false);
        }
        item.state = new_state;
        item.updated_at = now;
        update.apply_to(item);
        store.history.push((id.to_string(), expected, new_state));
        Ok(true)
    }

    async fn list_by_state(&self, state: ItemState) -> PipelineResult<Vec<Item>> {
        self.check_available()?;
        let store = lock(&self.store);
        let mut items: Vec<Item> = store
            .items
            .values()
            .filter(|item| item.state == state)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn count_by_state(&self) -> PipelineResult<StateCounts> {
        self.check_available()?;
        let mut counts = StateCounts::default();
        for item in lock(&self.store).items.values() {
            counts.increment(item.state);
        }
        Ok(counts)
    }

    async fn last_polled_at(&self, source_id: &str) -> PipelineResult<Option<DateTime<Utc>>> {
        self.check_available()?;
        Ok(lock(&self.store).polls.get(source_id).copied())
    }

    async fn record_poll(&self, source_id: &str, at: DateTime<Utc>) -> PipelineResult<()> {
        self.check_available()?;
        lock(&self.store).polls.insert(source_id.to_string(), at);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIdentityRepository {
    identities: Mutex<BTreeMap<String, WorkerIdentity>>,
}

impl InMemoryIdentityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<WorkerIdentity> {
        lock(&self.identities).get(name).cloned()
    }
}

#[async_trait]
impl IdentityRepository for InMemoryIdentityRepository {
    async fn list_identities(&self) -> PipelineResult<Vec<WorkerIdentity>> {
        Ok(lock(&self.identities).values().cloned().collect())
    }

    async fn save_identity(&self, identity: &WorkerIdentity) -> PipelineResult<()> {
        lock(&self.identities).insert(identity.name.clone(), identity.clone());
        Ok(())
    }

    async fn save_health(&self, identity: &WorkerIdentity) -> PipelineResult<()> {
        let mut identities = lock(&self.identities);
        let is_enabled = identities
            .get(&identity.name)
            .map_or(identity.is_enabled, |stored| stored.is_enabled);
        identities.insert(
            identity.name.clone(),
            WorkerIdentity {
                is_enabled,
                ..identity.clone()
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: &str) -> ItemDraft {
        ItemDraft {
            id: id.to_string(),
            source_id: "channel-a".to_string(),
            title: None,
            url: format!("https://example.com/{id}"),
            description: None,
            destination: None,
        }
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_mismatched_state() {
        let repo = InMemoryItemRepository::new();
        let now = Utc::now();
        assert!(repo.insert_if_absent(&draft("a"), now).await.unwrap());
        assert!(!repo.insert_if_absent(&draft("a"), now).await.unwrap());

        let update = ItemUpdate::default();
        assert!(repo
            .transition_if_state("a", ItemState::Discovered, ItemState::Downloading, &update, now)
            .await
            .unwrap());
        assert!(!repo
            .transition_if_state("a", ItemState::Discovered, ItemState::Downloading, &update, now)
            .await
            .unwrap());
        assert_eq!(
            repo.history("a"),
            vec![(ItemState::Discovered, ItemState::Downloading)]
        );
    }

    #[tokio::test]
    async fn unavailable_store_returns_storage_error() {
        let repo = InMemoryItemRepository::new();
        repo.set_unavailable(true);
        let err = repo.get("a").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
