//! sqlite-adapter - SQLite-backed document store implementing the `ItemStore` port.
//!
//! Purpose
//! - Persist items as JSON documents in a single collection table so the
//!   service can run locally without an external database server.
//! - Implements `ItemStore` and `HealthProbe` from the `domain` crate.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - The collection is `(id TEXT PRIMARY KEY, sort INTEGER, doc TEXT)` with an
//!   index on `sort`; only `sort` is lifted out of the document for ordering.
//! - The connection is opened by `start` and closed by `stop`. Driver calls are
//!   blocking and run on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use domain::{Context, CoreError, HealthProbe, Item, ItemStore, Pagination, SortOrder};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

type Slot = Arc<Mutex<Option<Connection>>>;

/// SQLite document store.
pub struct SqliteItemStore {
    path: PathBuf,
    namespace: String,
    conn: Slot,
}

impl SqliteItemStore {
    /// Configure a store for the database file at `path`, keeping documents in
    /// the `namespace` table. Nothing is opened until `start`.
    pub fn new<P: AsRef<Path>>(path: P, namespace: &str) -> Result<Self, CoreError> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CoreError::Repository(format!(
                "invalid namespace '{namespace}'"
            )));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            namespace: namespace.to_string(),
            conn: Arc::new(Mutex::new(None)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open connection on the blocking pool, racing the
    /// context. `op` names the call in the error chain.
    async fn with_conn<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, CoreError> + Send + 'static,
    {
        let slot = Arc::clone(&self.conn);
        let table = self.namespace.clone();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || {
                let guard = lock(&slot)?;
                let conn = guard
                    .as_ref()
                    .ok_or_else(|| CoreError::Repository("store not started".into()))?;
                f(conn, &table)
            })
            .await
            .map_err(|e| CoreError::Repository(format!("blocking task: {e}")))?
        })
        .await
        .map_err(|e| e.context(op))
    }

    /// Remove an item outright. Not part of the store port; used for cleanup.
    pub async fn delete_item(&self, ctx: &Context, id: Uuid) -> Result<(), CoreError> {
        self.with_conn(ctx, "sqlite.delete_item", move |conn, table| {
            let n = conn
                .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id.to_string()])
                .map_err(map_sqerr)?;
            if n == 0 {
                return Err(CoreError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

fn lock(slot: &Slot) -> Result<std::sync::MutexGuard<'_, Option<Connection>>, CoreError> {
    slot.lock()
        .map_err(|_| CoreError::Repository("mutex poisoned".into()))
}

fn init_schema(conn: &Connection, table: &str) -> Result<(), CoreError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            sort INTEGER NOT NULL,
            doc TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {table}_sorting ON {table}(sort);
        "#
    ))
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

fn to_doc(item: &Item) -> Result<String, CoreError> {
    serde_json::to_string(item).map_err(|e| CoreError::Repository(format!("encode document: {e}")))
}

fn from_doc(doc: &str) -> Result<Item, CoreError> {
    serde_json::from_str(doc).map_err(|e| CoreError::Repository(format!("decode document: {e}")))
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn create_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        let doc = to_doc(&item)?;
        self.with_conn(ctx, "sqlite.create_item", move |conn, table| {
            let res = conn.execute(
                &format!("INSERT INTO {table}(id, sort, doc) VALUES (?1, ?2, ?3)"),
                params![item.id.to_string(), item.sort, doc],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(CoreError::AlreadyExists)
                }
                Err(e) => Err(map_sqerr(e)),
            }
        })
        .await
    }

    async fn get_item(&self, ctx: &Context, id: Uuid) -> Result<Option<Item>, CoreError> {
        self.with_conn(ctx, "sqlite.get_item", move |conn, table| {
            let doc: Option<String> = conn
                .query_row(
                    &format!("SELECT doc FROM {table} WHERE id = ?1"),
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqerr)?;
            doc.as_deref().map(from_doc).transpose()
        })
        .await
    }

    async fn get_items(
        &self,
        ctx: &Context,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<Vec<Item>, CoreError> {
        self.with_conn(ctx, "sqlite.get_items", move |conn, table| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT doc FROM {table} ORDER BY sort {} LIMIT ?1 OFFSET ?2",
                    order.as_str()
                ))
                .map_err(map_sqerr)?;
            let mut rows = stmt
                .query(params![pagination.limit as i64, pagination.offset as i64])
                .map_err(map_sqerr)?;
            let mut out = Vec::with_capacity(pagination.limit.min(512));
            while let Some(row) = rows.next().map_err(map_sqerr)? {
                let doc: String = row.get(0).map_err(map_sqerr)?;
                out.push(from_doc(&doc)?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_items_count(&self, ctx: &Context) -> Result<i64, CoreError> {
        self.with_conn(ctx, "sqlite.get_items_count", move |conn, table| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(map_sqerr)
        })
        .await
    }

    async fn update_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        self.with_conn(ctx, "sqlite.update_item", move |conn, table| {
            let tx = conn.unchecked_transaction().map_err(map_sqerr)?;
            let existing: Option<String> = tx
                .query_row(
                    &format!("SELECT doc FROM {table} WHERE id = ?1"),
                    params![item.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqerr)?;
            let Some(existing) = existing else {
                return Err(CoreError::NotFound);
            };

            let mut stored = from_doc(&existing)?;
            stored.name = item.name;
            stored.sort = item.sort;
            stored.related = item.related;
            stored.updated_at = item.updated_at;
            tx.execute(
                &format!("UPDATE {table} SET sort = ?2, doc = ?3 WHERE id = ?1"),
                params![stored.id.to_string(), stored.sort, to_doc(&stored)?],
            )
            .map_err(map_sqerr)?;
            tx.commit().map_err(map_sqerr)
        })
        .await
    }

    async fn start(&self, ctx: &Context) -> Result<(), CoreError> {
        let slot = Arc::clone(&self.conn);
        let path = self.path.clone();
        let table = self.namespace.clone();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).map_err(map_sqerr)?;
                }
                let conn = Connection::open(&path).map_err(map_sqerr)?;
                init_schema(&conn, &table)?;
                *lock(&slot)? = Some(conn);
                Ok(())
            })
            .await
            .map_err(|e| CoreError::Repository(format!("blocking task: {e}")))?
        })
        .await
        .map_err(|e| e.context("sqlite.start"))?;
        info!(path = %self.path.display(), namespace = %self.namespace, "sqlite store opened");
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) {
        let conn = match lock(&self.conn) {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                warn!(err = %e, "sqlite stop");
                return;
            }
        };
        // already closed
        let Some(conn) = conn else { return };
        if let Err((_, e)) = conn.close() {
            warn!(err = %e, "sqlite close failed");
        }
    }
}

#[async_trait]
impl HealthProbe for SqliteItemStore {
    async fn is_connected(&self, ctx: &Context) -> bool {
        self.with_conn(ctx, "sqlite.ping", |conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sqerr)
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Atom, Nested};

    async fn tmp_store() -> (SqliteItemStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteItemStore::new(dir.path().join("data").join("t.db"), "items").unwrap();
        store.start(&Context::background()).await.unwrap();
        (store, dir)
    }

    fn mk_item(name: &str, sort: i64) -> Item {
        let mut item = Item::new(name, sort);
        item.id = Uuid::new_v4();
        item.created_at = chrono::Utc::now();
        item.updated_at = Some(item.created_at);
        item.related = vec![Nested {
            id: Uuid::new_v4(),
            name: format!("{name}-nested"),
            sort: 1,
            related: vec![Atom {
                id: Uuid::new_v4(),
                name: "atom".into(),
            }],
        }];
        item
    }

    #[tokio::test]
    async fn create_get_roundtrip_keeps_the_whole_document() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let item = mk_item("abc", 4);
        store.create_item(&ctx, item.clone()).await.unwrap();

        let got = store.get_item(&ctx, item.id).await.unwrap().unwrap();
        assert_eq!(got, item);
        assert_eq!(got.related[0].related[0].name, "atom");
        assert!(store.get_item(&ctx, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_duplicate_conflict() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let item = mk_item("dup", 0);
        store.create_item(&ctx, item.clone()).await.unwrap();
        let err = store.create_item(&ctx, item).await.unwrap_err();
        assert!(matches!(err.root(), CoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn pages_follow_sort_order() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        for i in [5, -2, 40, 7, 0] {
            store.create_item(&ctx, mk_item(&format!("k{i}"), i)).await.unwrap();
        }
        let page = Pagination { limit: 3, offset: 1 };
        let desc: Vec<i64> = store
            .get_items(&ctx, page, SortOrder::Desc)
            .await
            .unwrap()
            .iter()
            .map(|i| i.sort)
            .collect();
        assert_eq!(desc, vec![7, 5, 0]);
        let asc: Vec<i64> = store
            .get_items(&ctx, page, SortOrder::Asc)
            .await
            .unwrap()
            .iter()
            .map(|i| i.sort)
            .collect();
        assert_eq!(asc, vec![0, 5, 7]);
        assert_eq!(store.get_items_count(&ctx).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn update_rewrites_fields_but_not_creation_time() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let item = mk_item("old", 1);
        store.create_item(&ctx, item.clone()).await.unwrap();

        let mut changed = Item::new("new", 99);
        changed.id = item.id;
        changed.updated_at = Some(chrono::Utc::now());
        store.update_item(&ctx, changed.clone()).await.unwrap();

        let got = store.get_item(&ctx, item.id).await.unwrap().unwrap();
        assert_eq!(got.name, "new");
        assert_eq!(got.sort, 99);
        assert!(got.related.is_empty());
        assert_eq!(got.created_at, item.created_at);
        assert_eq!(got.updated_at, changed.updated_at);

        // the sort column follows the document
        let top = store
            .get_items(&ctx, Pagination { limit: 1, offset: 0 }, SortOrder::Desc)
            .await
            .unwrap();
        assert_eq!(top[0].id, item.id);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let err = store.update_item(&ctx, mk_item("ghost", 0)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn lifecycle_controls_connectivity_and_data_survives() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let item = mk_item("durable", 3);
        store.create_item(&ctx, item.clone()).await.unwrap();
        assert!(store.is_connected(&ctx).await);

        store.stop(&ctx).await;
        store.stop(&ctx).await;
        assert!(!store.is_connected(&ctx).await);
        let err = store.get_item(&ctx, item.id).await.unwrap_err();
        assert!(err.to_string().contains("store not started"));

        store.start(&ctx).await.unwrap();
        assert_eq!(store.get_item(&ctx, item.id).await.unwrap().unwrap(), item);
    }

    #[tokio::test]
    async fn delete_removes_the_document() {
        let ctx = Context::background();
        let (store, _dir) = tmp_store().await;
        let item = mk_item("gone", 1);
        store.create_item(&ctx, item.clone()).await.unwrap();
        store.delete_item(&ctx, item.id).await.unwrap();
        assert!(store.get_item(&ctx, item.id).await.unwrap().is_none());
        assert!(store.delete_item(&ctx, item.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cancelled_context_is_refused() {
        let (store, _dir) = tmp_store().await;
        let ctx = Context::background();
        ctx.cancel();
        assert!(store.get_items_count(&ctx).await.unwrap_err().is_cancelled());
    }

    #[test]
    fn rejects_unsafe_namespace() {
        assert!(SqliteItemStore::new("x.db", "items; DROP TABLE x").is_err());
        assert!(SqliteItemStore::new("x.db", "").is_err());
        assert!(SqliteItemStore::new("x.db", "items_v2").is_ok());
    }
}
