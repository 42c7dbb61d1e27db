mod conn;
mod hub;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::hub::{RelayConfig, RelayHub};

#[derive(Parser, Debug)]
#[command(name = "statagg-relay")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:3000.
    #[arg(long, default_value = "")]
    addr: String,
    /// Evict agents silent for longer than this many seconds.
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    /// Period of the liveness sweep.
    #[arg(long, default_value_t = 10)]
    sweep_seconds: u64,
    /// Seconds to wait on a blocked socket write before giving up.
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(1);
        }
    };

    let hub = Arc::new(RelayHub::new(config.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.clone().spawn_stale_reaper(shutdown_rx);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err, addr = %config.addr);
            std::process::exit(1);
        }
    };

    info!(event = "relay_start", addr = %config.addr);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "relay_error", error = %err);
        std::process::exit(1);
    }

    info!(event = "relay_stop");
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<RelayHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

fn load_config() -> RelayConfig {
    let args = Args::parse();
    RelayConfig {
        addr: resolve_addr(&args.addr),
        stale_after: Duration::from_secs(args.stale_seconds),
        sweep_interval: Duration::from_secs(args.sweep_seconds),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("STATAGG_DEBUG"),
    }
}

fn init_logging(config: &RelayConfig) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("STATAGG_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("STATAGG_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "0.0.0.0:3000".to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
