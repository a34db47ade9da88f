//! # courier-server
//!
//! HTTP front for the Courier messaging core.
//!
//! This binary provides:
//! - **REST API** (axum) to send messages, list conversations, page through
//!   history and mark conversations read
//! - **Server-sent events** for live conversation threads and conversation
//!   lists
//! - **Per-participant send rate limiting**

mod api;
mod auth;
mod config;
mod error;
mod rate_limit;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_service::MessagingFacade;
use courier_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,courier_server=debug,courier_service=debug")
        }))
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let facade = MessagingFacade::new(db, config.service_config());
    let rate_limiter = RateLimiter::new(config.send_rate_per_sec, config.send_burst);

    let app_state = AppState {
        facade: facade.clone(),
        rate_limiter: rate_limiter.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // Periodic hub report
    let hub = facade.hub().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let stats = hub.stats();
            tracing::debug!(
                conversation_topics = stats.conversation_topics,
                participant_topics = stats.participant_topics,
                "Subscription hub"
            );
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
