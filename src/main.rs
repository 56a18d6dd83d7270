//! Scorelink binary entry point

use std::sync::Arc;
use std::time::Duration;

use scorelink::{AppState, config};
use scorelink::proxy::{InterceptProxy, SessionExchange};
use scorelink::worker::{ReconcileWorker, Scheduler, ScoreScraper};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState and the fetch dispatcher
/// 4. Start the intercepting proxy
/// 5. Start background tasks (dispatch loop, reconciliation, session probe)
/// 6. Start the HTTP API server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("SCORELINK__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "scorelink=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "scorelink=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Scorelink...");

    // 2. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        portal = %config.portal.base_url,
        bot_account = %config.worker.bot_account_id,
        "Configuration loaded"
    );

    // 3. Initialize application state
    let (state, dispatcher) = AppState::new(config.clone()).await?;

    // 4. Start the intercepting proxy
    let portal_base = url::Url::parse(&config.portal.base_url)?;
    let exchange = SessionExchange::new(state.cookie_store.clone(), &portal_base)?;
    let proxy = Arc::new(InterceptProxy::new(&config.proxy, exchange)?);
    let proxy_listener = tokio::net::TcpListener::bind(config.proxy.bind_addr()).await?;
    tracing::info!("Proxy listening on {}", config.proxy.bind_addr());

    // 5. Start background tasks
    let mut scheduler = Scheduler::new();
    scheduler.spawn("fetch-dispatch", dispatcher.run());
    scheduler.spawn("proxy", proxy.run(proxy_listener));

    let scraper = ScoreScraper::new(state.db.clone(), state.portal.clone(), &config.worker);
    let worker = Arc::new(ReconcileWorker::new(
        state.db.clone(),
        state.portal.clone(),
        scraper,
        config.worker.clone(),
        config.portal.friend_cap,
    ));
    scheduler.spawn_periodic(
        "reconcile",
        Duration::from_secs(config.worker.tick_seconds),
        move || {
            let worker = worker.clone();
            async move {
                worker.tick().await;
            }
        },
    );

    let probe = state.session_probe.clone();
    scheduler.spawn_periodic(
        "session-probe",
        Duration::from_secs(config.worker.probe_interval_seconds),
        move || {
            let probe = probe.clone();
            async move {
                if probe.is_expired().await {
                    tracing::warn!(
                        "Session cookie no longer authenticates; waiting for a login through the proxy"
                    );
                }
            }
        },
    );

    // 6. Start HTTP API server
    let app = scorelink::build_router(state.clone());
    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
