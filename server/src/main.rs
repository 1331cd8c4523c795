#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # httptun
//!
//! Tunnels TCP connections over plain HTTP requests, for networks that only
//! allow outbound HTTP.
//!
//! A client POSTs a destination, then moves bytes with sequence-numbered GET
//! (destination → client) and PUT (client → destination) requests. Retried
//! requests are safe: a repeated GET replays the same bytes and a repeated
//! PUT is acknowledged without being applied twice.
//!
//! ## API surface
//!
//! All requests must carry `Auth-Token: <token>`; otherwise `404`.
//!
//! | Method | Path                       | Success | Description                       |
//! |--------|----------------------------|---------|-----------------------------------|
//! | GET    | `/`                        | 200     | Banner                            |
//! | GET    | `/tunnels`                 | 200     | List tunnel descriptors           |
//! | POST   | `/tunnels`                 | 201     | Connect `{host, port}`            |
//! | GET    | `/tunnels/{id}`            | 200     | Tunnel descriptor                 |
//! | DELETE | `/tunnels/{id}`            | 202/204 | Close destination, remove tunnel  |
//! | GET    | `/tunnels/{id}/out/{seq}`  | 200     | Destination bytes (long-poll)     |
//! | PUT    | `/tunnels/{id}/in/{seq}`   | 201/202 | Bytes for the destination         |
//! | GET    | `/websocket/{host}/{port}` | 101     | WebSocket relay (base64 frames)   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap subcommands, sweep task, graceful shutdown
//! auth.rs            Auth-Token middleware, constant-time comparison
//! config.rs          TOML + env-var configuration
//! error.rs           TunnelError → status code mapping
//! routes/
//!   health.rs        GET /
//!   tunnels.rs       /tunnels endpoints
//! tunnel/
//!   session.rs       ServerTunnel buffers, sequences, long-poll slot
//!   destination.rs   destination socket task with read backpressure
//!   registry.rs      id → tunnel map, inactivity sweep
//! ws/
//!   mod.rs           WebSocket relay
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use httptun::{AppState, Config};

/// HTTP tunnel server.
#[derive(Parser)]
#[command(name = "httptun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    match run_server(config_path.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("httptun: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("httptun v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.token == "change-me" {
        warn!("Using default auth token; set HTTPTUN_AUTH_TOKEN or update config");
    }

    let state = AppState::new(config);
    let app = httptun::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen).await?;

    // Periodic sweep: close tunnels nobody has touched for a while
    let sweep_task = state.registry.spawn_sweeper(
        state.config.server.sweep_interval(),
        state.config.server.inactivity_timeout(),
    );

    info!("Server ready");

    // Closing every tunnel wakes parked long-polls, which graceful shutdown
    // would otherwise wait on forever.
    let registry = state.registry.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        registry.close_all().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    sweep_task.abort();
    info!(
        uptime_secs = state.start_time.elapsed().as_secs(),
        "Goodbye"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
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
