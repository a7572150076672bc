//! mail-tempbox-rs: disposable-email gateway over an IMAP catch-all
//!
//! Users claim short-lived local-parts under a set of catch-all domains;
//! messages addressed to those local-parts are pulled from an upstream
//! IMAP mailbox, demultiplexed by original recipient into redis-backed
//! per-address inboxes, and exposed through an HTTP/JSON API with SSE
//! notifications. All per-address state expires within the retention
//! window.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and role-based spawn
//! - [`config`]: Environment-driven configuration with a store-resident
//!   dynamic layer on top
//! - [`errors`]: Application error model with HTTP status mapping
//! - [`store`]: Redis facade — reservations, records, indexes, dedup,
//!   high-water marks, rate counters, pub/sub
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`ingest`]: The periodic catch-all ingestion pipeline
//! - [`mime`]: Message parsing and body assembly
//! - [`recipient`]: Original-recipient identification
//! - [`allowlist`]: Merged static + dynamic domain allow-list
//! - [`ratelimit`]: Store-backed fixed-window rate limiting
//! - [`server`]: HTTP/JSON API and SSE streaming
//! - [`models`]: Request/response DTOs and the stored message shape
//! - [`message_id`]: Time-ordered sortable message ids

mod allowlist;
mod config;
mod errors;
mod imap;
mod ingest;
mod message_id;
mod mime;
mod models;
mod ratelimit;
mod recipient;
mod server;
mod store;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::ingest::Ingestor;
use crate::server::AppState;
use crate::store::Store;

/// Application entry point
///
/// Initializes tracing from environment, loads config, connects the
/// store (fatal if unreachable), and runs the responsibilities the
/// configured role selects. SIGINT/SIGTERM trigger a coordinated
/// shutdown: the ingestor stops between messages and the API drains with
/// a bounded grace window.
///
/// # Environment Variables
///
/// See [`GatewayConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// TEMPBOX_ALLOWED_DOMAINS=catty.my.id \
/// TEMPBOX_IMAP_HOST=mail.upstream.example \
/// TEMPBOX_IMAP_USER=catchall@upstream.example \
/// TEMPBOX_IMAP_PASS=secret \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(GatewayConfig::load_from_env()?);

    let store = match Store::connect(&config.redis_url, config.retention_seconds).await {
        Ok(store) => store,
        Err(e) => {
            error!(redis_url = %config.redis_url, error = %e, "store unreachable at boot");
            std::process::exit(1);
        }
    };
    info!(role = ?config.role, "store connected");

    let shutdown = CancellationToken::new();
    tokio::spawn(signal_listener(shutdown.clone()));

    let mut tasks = Vec::new();

    if config.role.runs_ingestor() {
        let ingestor = Ingestor::new(config.clone(), store.clone())?;
        tasks.push(tokio::spawn(ingestor.run(shutdown.clone())));
    }

    if config.role.serves_api() {
        let state = Arc::new(AppState::new(config.clone(), store));
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(state, token.clone()).await {
                error!(error = %e, "api server exited");
                token.cancel();
            }
        }));
    }

    for task in tasks {
        task.await?;
    }
    info!("shutdown complete");
    Ok(())
}

/// Cancel the shared token on SIGINT or SIGTERM
async fn signal_listener(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received ctrl-c");
    }

    shutdown.cancel();
}
