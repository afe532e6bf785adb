//! api-server - HTTP API for the item service workspace.
//!
//! Exposes create/get/list/update of items plus liveness and health probes.
//! - Storage: SQLite document store (default) or in-memory, via STORAGE_PROVIDER.
//! - Single-item reads are cached for CACHE_TTL_SECS; list reads are filtered
//!   and sorted per item before they are returned.
//!
//! Run:
//! ```bash
//! # pretty logs (default); SERVER_PORT optional
//! cargo run -p api-server
//!
//! # in-memory storage, JSON logs
//! STORAGE_PROVIDER=memory LOG_FORMAT=json cargo run -p api-server
//! ```
//!
//! Configuration: optional TOML file (`CONFIG_PATH`) plus environment
//! variables; see `config.rs`.
//!

mod config;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use domain::adapters::memory_repo::InMemoryItemStore;
use domain::health::HealthChecker;
use domain::service::ItemService;
use domain::{
    Atom, Context, CoreError, HealthProbe, Item, ItemStore, Nested, Pagination, SortOrder,
    SystemClock,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Time allowed for closing the service after the server stops.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

// Local store abstraction supporting memory or sqlite (feature-gated).
enum AnyStore {
    Memory(InMemoryItemStore),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteItemStore),
}

#[async_trait]
impl ItemStore for AnyStore {
    async fn create_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        match self {
            AnyStore::Memory(s) => s.create_item(ctx, item).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.create_item(ctx, item).await,
        }
    }

    async fn get_item(&self, ctx: &Context, id: Uuid) -> Result<Option<Item>, CoreError> {
        match self {
            AnyStore::Memory(s) => s.get_item(ctx, id).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.get_item(ctx, id).await,
        }
    }

    async fn get_items(
        &self,
        ctx: &Context,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<Vec<Item>, CoreError> {
        match self {
            AnyStore::Memory(s) => s.get_items(ctx, pagination, order).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.get_items(ctx, pagination, order).await,
        }
    }

    async fn get_items_count(&self, ctx: &Context) -> Result<i64, CoreError> {
        match self {
            AnyStore::Memory(s) => s.get_items_count(ctx).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.get_items_count(ctx).await,
        }
    }

    async fn update_item(&self, ctx: &Context, item: Item) -> Result<(), CoreError> {
        match self {
            AnyStore::Memory(s) => s.update_item(ctx, item).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.update_item(ctx, item).await,
        }
    }

    async fn start(&self, ctx: &Context) -> Result<(), CoreError> {
        match self {
            AnyStore::Memory(s) => s.start(ctx).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.start(ctx).await,
        }
    }

    async fn stop(&self, ctx: &Context) {
        match self {
            AnyStore::Memory(s) => s.stop(ctx).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.stop(ctx).await,
        }
    }
}

#[async_trait]
impl HealthProbe for AnyStore {
    async fn is_connected(&self, ctx: &Context) -> bool {
        match self {
            AnyStore::Memory(s) => s.is_connected(ctx).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.is_connected(ctx).await,
        }
    }
}

type Service = ItemService<AnyStore, SystemClock>;

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    checker: HealthChecker<AnyStore>,
    request_timeout: Duration,
}

impl AppState {
    fn new(store: AnyStore, cfg: &config::Config) -> Self {
        let store = Arc::new(store);
        Self {
            service: Arc::new(ItemService::new(
                Arc::clone(&store),
                SystemClock,
                cfg.service_config(),
            )),
            checker: HealthChecker::new(store),
            request_timeout: cfg.request_timeout,
        }
    }

    fn request_ctx(&self) -> Context {
        Context::with_timeout(self.request_timeout)
    }
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.log_staleness();

    let store = match build_store(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to build store");
            std::process::exit(1);
        }
    };
    let state = AppState::new(store, &cfg);

    // Refuse to serve without a working store
    if let Err(e) = state.service.start(&Context::background()).await {
        error!(err = %e, "failed to start item service");
        std::process::exit(1);
    }

    let app = router(state.clone());

    let listener = match tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(err = %e, host = %cfg.host, port = cfg.port, "bind failed");
            shutdown(&state).await;
            std::process::exit(1);
        }
    };
    info!(host = %cfg.host, port = cfg.port, "api-server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(err = %e, "server error");
    }
    shutdown(&state).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(err = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn shutdown(state: &AppState) {
    let ctx = Context::with_timeout(SHUTDOWN_BUDGET);
    if tokio::time::timeout(SHUTDOWN_BUDGET, state.service.close(&ctx))
        .await
        .is_err()
    {
        warn!(budget = ?SHUTDOWN_BUDGET, "shutdown budget exceeded");
    }
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct a store instance based on config and feature flags.
fn build_store(cfg: &config::Config) -> Result<AnyStore, CoreError> {
    match cfg.storage_provider {
        #[cfg(feature = "sqlite")]
        config::StorageProvider::Sqlite => Ok(AnyStore::Sqlite(
            sqlite_adapter::SqliteItemStore::new(&cfg.db_path, &cfg.db_namespace)?,
        )),
        #[cfg(not(feature = "sqlite"))]
        config::StorageProvider::Sqlite => {
            warn!("built without the sqlite feature; using in-memory storage");
            Ok(AnyStore::Memory(InMemoryItemStore::new()))
        }
        config::StorageProvider::Memory => Ok(AnyStore::Memory(InMemoryItemStore::new())),
    }
}

fn router(state: AppState) -> Router {
    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    Router::new()
        .route("/live", get(get_live))
        .route("/health", get(get_health))
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", get(get_item).put(update_item))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct AtomReq {
    #[serde(default)]
    id: Option<Uuid>,
    name: String,
}

#[derive(Deserialize)]
struct NestedReq {
    #[serde(default)]
    id: Option<Uuid>,
    name: String,
    #[serde(default)]
    sort: i64,
    #[serde(default)]
    related: Vec<AtomReq>,
}

/// Body of both create and update requests.
#[derive(Deserialize)]
struct ItemReq {
    name: String,
    #[serde(default)]
    sort: i64,
    #[serde(default)]
    related: Vec<NestedReq>,
}

impl ItemReq {
    fn into_item(self) -> Item {
        let mut item = Item::new(self.name, self.sort);
        item.related = self
            .related
            .into_iter()
            .map(|nst| Nested {
                id: nst.id.unwrap_or_else(Uuid::new_v4),
                name: nst.name,
                sort: nst.sort,
                related: nst
                    .related
                    .into_iter()
                    .map(|atom| Atom {
                        id: atom.id.unwrap_or_else(Uuid::new_v4),
                        name: atom.name,
                    })
                    .collect(),
            })
            .collect();
        item
    }
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct AtomOut {
    id: Uuid,
    name: String,
}

#[derive(Serialize)]
struct NestedOut {
    id: Uuid,
    name: String,
    sort: i64,
    related: Vec<AtomOut>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemOut {
    id: Uuid,
    name: String,
    sort: i64,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
    related: Vec<NestedOut>,
}

#[derive(Serialize)]
struct ListOut {
    items: Vec<ItemOut>,
    total: i64,
}

#[derive(Serialize)]
struct CreatedOut {
    id: Uuid,
}

fn item_to_out(item: Item) -> ItemOut {
    ItemOut {
        id: item.id,
        name: item.name,
        sort: item.sort,
        created_at: http_common::datetime_to_rfc3339(item.created_at),
        updated_at: item.updated_at.map(http_common::datetime_to_rfc3339),
        related: item
            .related
            .into_iter()
            .map(|nst| NestedOut {
                id: nst.id,
                name: nst.name,
                sort: nst.sort,
                related: nst
                    .related
                    .into_iter()
                    .map(|atom| AtomOut {
                        id: atom.id,
                        name: atom.name,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Map a service error onto a status code and error envelope.
fn error_response(err: &CoreError) -> Response {
    match err.root() {
        CoreError::NotFound => {
            (StatusCode::NOT_FOUND, Json(http_common::json_err("not_found"))).into_response()
        }
        CoreError::AlreadyExists => {
            (StatusCode::CONFLICT, Json(http_common::json_err("conflict"))).into_response()
        }
        CoreError::Cancelled | CoreError::DeadlineExceeded => {
            warn!(err = %err, "request timed out");
            (StatusCode::GATEWAY_TIMEOUT, Json(http_common::json_err("timeout"))).into_response()
        }
        _ => {
            error!(err = %err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(http_common::json_err("internal")),
            )
                .into_response()
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(http_common::json_err("invalid_id")),
        )
            .into_response()
    })
}

async fn get_live() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    if state.checker.health_check(&state.request_ctx()).await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
    } else {
        warn!("health check failed: store not connected");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(http_common::json_err("unavailable")),
        )
            .into_response()
    }
}

async fn list_items(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let Some(limit) = http_common::resolve_limit(q.limit) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(http_common::json_error_with_message(
                "bad_request",
                &format!("limit must be between 1 and {}", http_common::MAX_PAGE_LIMIT),
            )),
        )
            .into_response();
    };
    let pagination = Pagination {
        limit,
        offset: q.offset.unwrap_or(0),
    };

    match state
        .service
        .get_items_paginated(&state.request_ctx(), pagination)
        .await
    {
        Ok((items, total)) => (
            StatusCode::OK,
            Json(ListOut {
                items: items.into_iter().map(item_to_out).collect(),
                total,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_item(State(state): State<AppState>, Json(body): Json<ItemReq>) -> Response {
    match state
        .service
        .create_item(&state.request_ctx(), body.into_item())
        .await
    {
        Ok(id) => {
            info!(%id, "create ok");
            (StatusCode::OK, Json(CreatedOut { id })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn get_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_item(&state.request_ctx(), id).await {
        Ok(Some(item)) => (StatusCode::OK, Json(item_to_out(item))).into_response(),
        Ok(None) => {
            (StatusCode::NOT_FOUND, Json(http_common::json_err("not_found"))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ItemReq>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .service
        .update_item(&state.request_ctx(), id, body.into_item())
        .await
    {
        Ok(()) => {
            info!(%id, "update ok");
            (StatusCode::OK, Json(serde_json::json!({}))).into_response()
        }
        Err(e) => error_response(&e),
    }
}
