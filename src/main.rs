#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunneld
//!
//! Reverse tunnel server. Agents running next to a private HTTP service open a
//! WebSocket to `/tunnel`, claim a subdomain, and receive the public traffic
//! for `<subdomain>.<domain>` as JSON frames over that socket.
//!
//! ## Subcommands
//!
//! - `tunneld serve [--config <path>]` (default) - run the server
//!
//! ## API surface (base domain)
//!
//! | Method | Path                     | Description                              |
//! |--------|--------------------------|------------------------------------------|
//! | GET    | `/tunnel`                | Agent WebSocket (register / response)    |
//! | GET    | `/ping`                  | Liveness probe                           |
//! | GET    | `/api/stats`             | Tunnel counters and live tunnel list     |
//! | GET    | `/api/check/{subdomain}` | Subdomain availability                   |
//! | GET    | `/events`                | SSE stats feed                           |
//!
//! Any request whose `Host` is `<subdomain>.<domain>` is forwarded to the
//! agent holding that subdomain instead.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, tracing, graceful shutdown
//! server.rs        - router assembly, expiry sweep task
//! state.rs         - AppState (config, manager, SSE feed)
//! config.rs        - TOML + env-var configuration
//! auth.rs          - agent token validators
//! routes/
//!   health.rs      - GET /ping
//!   stats.rs       - GET /api/stats, GET /api/check/{subdomain}
//!   events.rs      - GET /events (SSE)
//! tunnel/
//!   protocol.rs    - wire messages, base64 body codec
//!   connection.rs  - one registered agent (outbound frame queue)
//!   registry.rs    - subdomain -> connection map
//!   pending.rs     - request id -> waiting public request
//!   manager.rs     - TunnelManager: register, forward, resolve, teardown
//!   handler.rs     - agent control-channel state machine, WS pump
//!   router.rs      - Host classification, forwarding, default page
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tunneld::{server, AppState, Config};

/// Reverse tunnel server.
#[derive(Parser)]
#[command(name = "tunneld", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config.as_deref()).await,
    }
}

async fn serve(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tunneld: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> std::io::Result<()> {
    info!("tunneld v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        domain = %config.tunnel.domain,
        policy = ?config.tunnel.subdomain_policy,
        "Listening on {}",
        config.server.listen
    );
    if config.auth.token.as_deref().is_none_or(str::is_empty) {
        warn!(
            min_len = config.auth.min_token_length,
            "No auth token configured, accepting any sufficiently long token"
        );
    }

    let listener = TcpListener::bind(&config.server.listen).await?;
    let state = AppState::new(config);
    let app = server::build_router(state.clone());

    let sweep_task = server::spawn_expiry_sweep(
        state.manager.clone(),
        std::time::Duration::from_secs(state.config.tunnel.sweep_interval_secs),
    );

    // In-flight public requests wait on agents; fail them so their
    // connections can finish before the listener closes.
    let manager = state.manager.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        manager.drain_all().await;
    };

    info!("Server ready");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    // Cleanup
    sweep_task.abort();
    info!("Goodbye");
    result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
