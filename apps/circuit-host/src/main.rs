use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use circuit_host::fault::CircuitFault;
use circuit_host::server::{router, spawn_heartbeat};
use circuit_host::{CircuitHub, CircuitOptions};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "circuit-host", about = "Hosts stateful client circuits over websockets")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CIRCUIT_HOST_BIND", default_value = "127.0.0.1:8090")]
    bind: SocketAddr,

    /// Interval between heartbeat renders, in milliseconds
    #[arg(long, env = "CIRCUIT_RENDER_INTERVAL_MS", default_value_t = 1000)]
    render_interval_ms: u64,

    /// Send full fault messages to clients
    #[arg(long)]
    detailed_errors: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut options = CircuitOptions::from_env();
    if cli.detailed_errors {
        options.detailed_errors = true;
    }
    info!(target = "circuit_host::main", ?options, "starting circuit host");

    let hub = CircuitHub::builder(options)
        .on_unhandled_fault(Arc::new(|fault: &CircuitFault| {
            error!(
                target = "circuit_host::main",
                circuit = %fault.circuit,
                error = %fault.error,
                fatal = fault.is_fatal(),
                "unhandled circuit fault"
            );
        }))
        .build();

    let heartbeat = spawn_heartbeat(
        hub.clone(),
        Duration::from_millis(cli.render_interval_ms.max(1)),
    );

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(target = "circuit_host::main", addr = %cli.bind, "listening");

    let served = axum::serve(listener, router(hub.clone())).await;
    heartbeat.abort();
    hub.shutdown();
    served.context("serving websocket endpoint")
}
