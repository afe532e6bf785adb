use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, ExpiringCache};
use crate::transform::{sort_related_desc, transform};
use crate::{Clock, Context, CoreError, Item, ItemStore, Pagination, SortOrder};

/// Service tuning knobs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    /// Drop the cached copy after a successful update. Off by default: readers
    /// may then see the pre-update item for up to one cache TTL.
    pub invalidate_on_update: bool,
}

/// Application service orchestrating reads and writes of items.
///
/// Generic over the store and the clock. Single-item reads go through an
/// owned expiring cache (cache-aside); list reads are filtered and sorted
/// per item on concurrent tasks and returned in the store's page order.
pub struct ItemService<S: ItemStore, C: Clock> {
    store: Arc<S>,
    cache: ExpiringCache<Uuid, Item>,
    clock: C,
    invalidate_on_update: bool,
}

impl<S: ItemStore, C: Clock> ItemService<S, C> {
    pub fn new(store: Arc<S>, clock: C, config: ServiceConfig) -> Self {
        Self {
            store,
            cache: ExpiringCache::new(config.cache),
            clock,
            invalidate_on_update: config.invalidate_on_update,
        }
    }

    pub fn cache(&self) -> &ExpiringCache<Uuid, Item> {
        &self.cache
    }

    /// Longest time a read may lag behind a write to the same item.
    pub fn staleness_window(&self) -> Option<Duration> {
        if self.invalidate_on_update {
            None
        } else {
            Some(self.cache.ttl())
        }
    }

    /// Start the cache sweeper, then the store session. A store that cannot
    /// start is fatal: the sweeper is stopped again and the error returned.
    pub async fn start(&self, ctx: &Context) -> Result<(), CoreError> {
        self.cache.start().await;
        if let Err(e) = ctx.run(self.store.start(ctx)).await {
            let _ = self.cache.stop().await;
            return Err(e.context("service.start"));
        }
        info!(ttl = ?self.cache.ttl(), "item service started");
        Ok(())
    }

    /// Stop the sweeper and close the store session. Failures are logged only.
    pub async fn close(&self, ctx: &Context) {
        if let Err(e) = self.cache.stop().await {
            warn!(err = %e, "cache stop failed");
        }
        let stopped = ctx
            .run(async {
                self.store.stop(ctx).await;
                Ok(())
            })
            .await;
        if let Err(e) = stopped {
            warn!(err = %e, "store stop interrupted");
        }
        info!("item service closed");
    }

    /// Persist a new item, generating an id when it has none.
    pub async fn create_item(&self, ctx: &Context, mut item: Item) -> Result<Uuid, CoreError> {
        if item.is_empty() {
            item.id = Uuid::new_v4();
        }
        item.created_at = self.clock.now();
        item.updated_at = Some(item.created_at);

        let id = item.id;
        ctx.run(self.store.create_item(ctx, item))
            .await
            .map_err(|e| e.context("service.create_item"))?;
        debug!(%id, "item created");
        Ok(id)
    }

    /// Cache-aside read. `Ok(None)` means the store has no such item.
    pub async fn get_item(&self, ctx: &Context, id: Uuid) -> Result<Option<Item>, CoreError> {
        if let Some(item) = self
            .cache
            .get(ctx, &id)
            .await
            .map_err(|e| e.context("service.get_item"))?
        {
            debug!(%id, "cache hit");
            return Ok(Some(item));
        }
        debug!(%id, "cache miss");

        let found = ctx
            .run(self.store.get_item(ctx, id))
            .await
            .map_err(|e| e.context("service.get_item"))?;
        if let Some(item) = &found {
            self.cache
                .set(ctx, id, item.clone())
                .await
                .map_err(|e| e.context("service.get_item"))?;
        }
        Ok(found)
    }

    /// One page of items, highest `sort` first, plus the total item count.
    ///
    /// The page and the count are two separate store calls and may observe
    /// different snapshots under concurrent writes.
    pub async fn get_items_paginated(
        &self,
        ctx: &Context,
        pagination: Pagination,
    ) -> Result<(Vec<Item>, i64), CoreError> {
        let items = ctx
            .run(self.store.get_items(ctx, pagination, SortOrder::Desc))
            .await
            .map_err(|e| e.context("service.get_items"))?;
        let total = ctx
            .run(self.store.get_items_count(ctx))
            .await
            .map_err(|e| e.context("service.get_items_count"))?;

        debug!(count = items.len(), total, "transforming page");
        let items = fan_out(items, |item| async move { Ok(prepare_for_listing(item)) })
            .await
            .map_err(|e| e.context("service.get_items_paginated"))?;
        Ok((items, total))
    }

    /// Overwrite the item stored under `id`. Any id carried by `item` is ignored.
    pub async fn update_item(&self, ctx: &Context, id: Uuid, mut item: Item) -> Result<(), CoreError> {
        item.id = id;
        item.updated_at = Some(self.clock.now());
        ctx.run(self.store.update_item(ctx, item))
            .await
            .map_err(|e| e.context("service.update_item"))?;

        if self.invalidate_on_update {
            self.cache
                .remove(ctx, &id)
                .await
                .map_err(|e| e.context("service.update_item"))?;
        }
        Ok(())
    }
}

/// Filtering plus nested ordering applied to every listed item.
fn prepare_for_listing(item: Item) -> Item {
    let mut item = transform(item);
    sort_related_desc(&mut item.related);
    item
}

/// Run `unit` on every element on its own task and collect the results in
/// input order.
///
/// Each task reports its index and the result lands in that slot, so task
/// completion order never shows. If any unit fails or panics the first
/// failure is returned, but only after every task has finished.
pub async fn fan_out<T, F, Fut>(inputs: Vec<T>, unit: F) -> Result<Vec<T>, CoreError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
{
    let len = inputs.len();
    let mut tasks = JoinSet::new();
    for (idx, input) in inputs.into_iter().enumerate() {
        let fut = unit(input);
        tasks.spawn(async move { (idx, fut.await) });
    }

    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(len).collect();
    let mut first_err: Option<CoreError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(value))) => slots[idx] = Some(value),
            Ok((_, Err(e))) => {
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert(CoreError::Repository(format!("fan-out task failed: {e}")));
            }
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }
    slots
        .into_iter()
        .collect::<Option<Vec<T>>>()
        .ok_or_else(|| CoreError::Repository("fan-out lost a result".into()))
}
