//! # httptun-client
//!
//! Listens on a local TCP port and carries every accepted connection through
//! an httptun server, over HTTP long-polling (`http://`, `https://`) or a
//! WebSocket (`ws://`, `wss://`).
//!
//! ```text
//! local app ──tcp──▶ httptun-client ══http══▶ httptun ──tcp──▶ destination
//! ```
//!
//! ## Architecture
//!
//! ```text
//! main.rs              entry point, config, tracing, ctrl-c
//! config.rs            flags / env / TOML resolution, URL sanitation
//! proxy.rs             accept loop, one tunnel per connection
//! pump.rs              socket ↔ tunnel byte pump
//! tunnel/
//!   mod.rs             Tunnel, TunnelConnector, transport selection
//!   sequencer.rs       read/write sequencing and retry rules
//!   http_poll.rs       POST / GET / PUT / DELETE transport
//!   websocket.rs       WebSocket transport
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use httptun_client::config::{Cli, ClientConfig};
use httptun_client::{proxy, ClientError, TunnelConnector};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("httptun-client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("httptun-client: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig) -> Result<(), ClientError> {
    if config.token.is_empty() {
        warn!("No auth token configured; set --token or HTTPTUN_AUTH_TOKEN");
    }

    let connector = Arc::new(TunnelConnector::from_config(&config)?);
    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(
        "httptun-client v{} listening on {}, tunnelling via {} ({:?})",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?,
        config.url.base(),
        config.url.transport(),
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
        }
        on_signal.cancel();
    });

    proxy::serve(listener, connector, shutdown).await;
    info!("Goodbye");
    Ok(())
}
