//! Bazaar Relay Server
//!
//! Real-time presence and message delivery for the marketplace:
//!
//! 1. **Presence**: users and shops hold a WebSocket open; the relay knows
//!    who is reachable right now, keyed by role and id.
//!
//! 2. **Delivery**: messages are always persisted first, then pushed live to
//!    the counterpart if online. The sender learns which happened.
//!
//! 3. **Seen-state**: every conversation tracks, per direction, whether the
//!    latest message has been seen, plus a recency timestamp for ordering.

mod api;
mod dispatch;
mod error;
mod handler;
mod messaging;
mod presence;
mod protocol;
mod seen;
mod state;
mod store;

use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};
use store::Store;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "bazaar-relay", version, about = "Marketplace presence and message relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "BAZAAR_PORT")]
    port: u16,

    /// SQLite database file. Omit to keep everything in memory.
    #[arg(long, env = "BAZAAR_DB_PATH")]
    db_path: Option<String>,

    /// WebSocket URL handed to clients by the hub-url endpoint.
    /// Defaults to ws://localhost:{port}/ws.
    #[arg(long, env = "BAZAAR_PUBLIC_URL")]
    public_url: Option<String>,

    /// Maximum message length in characters
    #[arg(long, default_value_t = 1000, env = "MAX_CONTENT_CHARS")]
    max_content_chars: usize,

    /// Interval between stale-connection sweeps, in seconds
    #[arg(long, default_value_t = 60, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "BAZAAR_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let public_url = self
            .public_url
            .unwrap_or_else(|| format!("ws://localhost:{}/ws", self.port));
        RelayConfig {
            port: self.port,
            database_path: self.db_path,
            public_url,
            max_content_chars: self.max_content_chars,
            sweep_interval_secs: self.sweep_interval_secs,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bazaar_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = args.into_config();

    let store = Store::open(config.database_path.as_deref()).expect("Failed to open database");
    match config.database_path {
        Some(ref path) => tracing::info!(path = path.as_str(), "Using SQLite database"),
        None => tracing::info!("Using in-memory database"),
    }

    let port = config.port;
    let sweep_interval = config.sweep_interval_secs;
    let state = RelayState::new(config, store);

    // Spawn periodic sweep of connections whose socket went away
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sweep_state.presence.sweep_closed();
        }
    });

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Bazaar relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    state.shutdown();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .merge(api::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "bazaar-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> error::Result<Json<serde_json::Value>> {
    Ok(Json(json!({
        "online_clients": state.presence.online_count(),
        "online": state
            .presence
            .online_keys()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "stored_messages": state.store.message_count()?,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
