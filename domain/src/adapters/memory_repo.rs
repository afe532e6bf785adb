use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{Context, CoreError, HealthProbe, Item, ItemStore, Pagination, SortOrder};

/// Simple in-memory item store for tests and `STORAGE_PROVIDER=memory`.
/// Data is lost when the process exits.
pub struct InMemoryItemStore {
    inner: Mutex<BTreeMap<Uuid, Item>>,
    connected: AtomicBool,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Uuid, Item>>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }

    /// Remove an item outright. Not part of the store port; used for cleanup.
    pub fn delete_item(&self, id: Uuid) -> Result<(), CoreError> {
        match self.lock()?.remove(&id) {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn create_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        ctx.check()?;
        let mut map = self.lock()?;
        if map.contains_key(&item.id) {
            return Err(CoreError::AlreadyExists);
        }
        map.insert(item.id, item);
        Ok(())
    }

    async fn get_item(&self, ctx: &Context, id: Uuid) -> Result<Option<Item>, CoreError> {
        ctx.check()?;
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn get_items(
        &self,
        ctx: &Context,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<Vec<Item>, CoreError> {
        ctx.check()?;
        let map = self.lock()?;
        let mut all: Vec<&Item> = map.values().collect();
        match order {
            SortOrder::Asc => all.sort_by(|a, b| a.sort.cmp(&b.sort)),
            SortOrder::Desc => all.sort_by(|a, b| b.sort.cmp(&a.sort)),
        }
        Ok(all
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .cloned()
            .collect())
    }

    async fn get_items_count(&self, ctx: &Context) -> Result<i64, CoreError> {
        ctx.check()?;
        Ok(self.lock()?.len() as i64)
    }

    async fn update_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        ctx.check()?;
        let mut map = self.lock()?;
        match map.get_mut(&item.id) {
            Some(stored) => {
                stored.name = item.name;
                stored.sort = item.sort;
                stored.related = item.related;
                stored.updated_at = item.updated_at;
                Ok(())
            }
            None => Err(CoreError::NotFound),
        }
    }

    async fn start(&self, ctx: &Context) -> Result<(), CoreError> {
        ctx.check()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for InMemoryItemStore {
    async fn is_connected(&self, _ctx: &Context) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
