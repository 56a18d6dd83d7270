//! Scorelink - score-scraping automation for a friend-gated game portal
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Job lifecycle endpoints (create/claim/patch)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Reconciliation Worker                        │
//! │  - Friend-request lifecycle state machine                   │
//! │  - Per-tier score scraping                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │   Fetch Queue (portal)   │   │   Intercepting Proxy         │
//! │  - fixed dispatch cadence│   │  - OAuth callback hijack     │
//! │  - cookie-aware retries  │   │  - session cookie harvest    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): jobs, cookie jars                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the job lifecycle
//! - `worker`: reconciliation loop, scraper, task scheduler
//! - `portal`: rate-limited fetch queue and typed portal operations
//! - `proxy`: intercepting proxy and session cookie exchange
//! - `cookies`: cookie jars and their persistence
//! - `data`: SQLite layer and models
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod cookies;
pub mod data;
pub mod error;
pub mod portal;
pub mod proxy;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use url::Url;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains shared resources
/// like the database pool, the cookie store and the portal queue handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Persistent cookie jars
    pub cookie_store: cookies::CookieStore,

    /// Enqueue handle of the portal fetch queue
    pub queue: portal::FetchQueueHandle,

    /// Typed portal operations (all routed through the queue)
    pub portal: portal::PortalClient,

    /// Session-health probe for the bot account
    pub session_probe: portal::SessionProbe,
}

impl AppState {
    /// Initialize application state.
    ///
    /// Returns the state plus the fetch dispatcher, which the caller must
    /// run on a background task for any portal traffic to move.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, portal::FetchDispatcher), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let cookie_store = cookies::CookieStore::new(db.clone());

        let base_url = Url::parse(&config.portal.base_url)
            .map_err(|e| error::AppError::Config(format!("portal.base_url: {}", e)))?;
        let probe_url = base_url
            .join("home/")
            .map_err(|e| error::AppError::Config(format!("portal.base_url: {}", e)))?;

        let session_probe = portal::SessionProbe::new(
            cookie_store.clone(),
            config.worker.bot_account_id.clone(),
            probe_url,
        )?;

        let (queue, dispatcher) = portal::FetchDispatcher::new(
            cookie_store.clone(),
            config.worker.bot_account_id.clone(),
            session_probe.clone(),
            config.portal.error_path.clone(),
            Duration::from_millis(config.portal.dispatch_interval_ms),
            config.portal.queue_high_water,
        )?;

        let portal = portal::PortalClient::new(
            queue.clone(),
            base_url,
            Duration::from_secs(config.portal.request_timeout_seconds),
            Duration::from_secs(config.portal.page_timeout_seconds),
        );

        tracing::info!("Application state initialized successfully");

        Ok((
            Self {
                config: Arc::new(config),
                db,
                cookie_store,
                queue,
                portal,
                session_probe,
            },
            dispatcher,
        ))
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/jobs", api::jobs_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
