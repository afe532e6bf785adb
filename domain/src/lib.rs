//! Domain library for the item service.
//!
//! Holds the domain types, the ports (traits) the service consumes, and the
//! error definitions. Storage drivers and HTTP concerns live in other crates;
//! only the in-memory store used for tests and local runs lives here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use context::Context;

/// A stored document: the unit the service reads and writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    pub sort: i64,
    pub name: String,
    #[serde(default)]
    pub related: Vec<Nested>,
    pub created_at: DateTime<Utc>,
    /// None until the item has been written once.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Build an unpersisted item (nil id, no timestamps set yet).
    pub fn new<S: Into<String>>(name: S, sort: i64) -> Self {
        Self {
            id: Uuid::nil(),
            sort,
            name: name.into(),
            related: Vec::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: None,
        }
    }

    /// An item without identity has not been persisted yet.
    pub fn is_empty(&self) -> bool {
        self.id.is_nil()
    }
}

/// Sub-document owned by an [`Item`]; replaced whenever the parent is rewritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nested {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub sort: i64,
    #[serde(default)]
    pub related: Vec<Atom>,
}

/// Leaf node owned by a [`Nested`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub id: Uuid,
    pub name: String,
}

/// Pagination parameters for list queries. Not validated here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

/// Ordering requested from the store, always on the `sort` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Data access port: the storage capability the service depends on.
///
/// Every call runs under a [`Context`]; implementations should return
/// [`CoreError::Cancelled`] or [`CoreError::DeadlineExceeded`] promptly
/// once the context is done. The service also enforces this on its side.
#[async_trait]
pub trait ItemStore: Send + Sync + 'static {
    async fn create_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError>;
    /// `Ok(None)` when no item has this id.
    async fn get_item(&self, ctx: &Context, id: Uuid) -> Result<Option<Item>, CoreError>;
    async fn get_items(
        &self,
        ctx: &Context,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<Vec<Item>, CoreError>;
    async fn get_items_count(&self, ctx: &Context) -> Result<i64, CoreError>;
    async fn update_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError>;

    /// Open the underlying session. Serving without it is not allowed.
    async fn start(&self, ctx: &Context) -> Result<(), CoreError>;
    /// Close the session; best effort.
    async fn stop(&self, ctx: &Context);
}

/// Connectivity probe consumed by the health checker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_connected(&self, ctx: &Context) -> bool;
}

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("repository error: {0}")]
    Repository(String),
    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Wrap with the name of the call site, keeping the original as source.
    pub fn context(self, context: &'static str) -> Self {
        CoreError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The innermost error, with every context layer peeled off.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CoreError::NotFound)
    }

    /// True for both explicit cancellation and an elapsed deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root(),
            CoreError::Cancelled | CoreError::DeadlineExceeded
        )
    }
}

pub mod adapters;
pub mod cache;
pub mod context;
pub mod health;
pub mod service;
pub mod transform;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_is_empty_until_it_has_an_id() {
        let mut item = Item::new("first", 1);
        assert!(item.is_empty());
        assert!(item.related.is_empty());
        assert!(item.updated_at.is_none());

        item.id = Uuid::new_v4();
        assert!(!item.is_empty());
    }

    #[test]
    fn context_wrapping_keeps_the_root() {
        let err = CoreError::Repository("disk full".into())
            .context("store.create_item")
            .context("service.create_item");
        assert_eq!(
            err.to_string(),
            "service.create_item: store.create_item: repository error: disk full"
        );
        assert!(matches!(err.root(), CoreError::Repository(msg) if msg == "disk full"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn cancellation_is_detected_through_context() {
        assert!(CoreError::Cancelled.context("x").is_cancelled());
        assert!(CoreError::DeadlineExceeded.is_cancelled());
        assert!(!CoreError::NotFound.is_cancelled());
    }

    #[test]
    fn item_serializes_camel_case_with_related_present() {
        let item = Item::new("doc", 3);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["related"], serde_json::json!([]));

        let back: Item = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
