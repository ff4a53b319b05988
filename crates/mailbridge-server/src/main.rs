//! # mailbridge
//!
//! Bridges an email account into a Matrix homeserver as an application
//! service.
//!
//! This binary provides:
//! - **Portals**: one chat room per mail conversation, each served by its own
//!   task so a conversation is never handled concurrently
//! - **Ghost users** standing in for mail addresses
//! - **Commands** to the bridge bot (`login`, `ping`, ...)
//! - **REST API** (axum) for health, status and the homeserver's transaction
//!   push endpoint

use std::sync::Arc;

use anyhow::Context;
use mailbridge_net::{AppServiceTransport, MemoryMailNetwork};
use mailbridge_server::api::{self, AppState};
use mailbridge_server::bridge::Bridge;
use mailbridge_server::config::BridgeConfig;
use mailbridge_server::converter::MailConverter;
use mailbridge_store::Database;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mailbridge_server=debug")),
        )
        .init();

    info!("Starting mailbridge v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = BridgeConfig::from_env();
    info!(?config, "Loaded configuration");
    let bot = config.bot_mxid().context("invalid bot username")?;

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("failed to open database")?;

    let transport = AppServiceTransport::new(&config.homeserver_url, &config.as_token, bot)
        .context("failed to set up homeserver client")?;

    // No IMAP/SMTP connector ships with the bridge yet; mail stays on the
    // in-process loopback network.
    warn!("Using the loopback mail network, mail does not leave this process");
    let mail = MemoryMailNetwork::new();

    let http_addr = config.http_addr;
    let bridge = Bridge::new(
        config,
        db,
        Arc::new(transport),
        Arc::new(mail),
        Arc::new(MailConverter),
    )
    .context("invalid configuration")?;

    // -----------------------------------------------------------------------
    // 4. Reconnect users and start the status collector
    // -----------------------------------------------------------------------
    bridge.start().await;

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let state = AppState::new(bridge.clone());
    let result = tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    bridge.stop().await;
    result
}
