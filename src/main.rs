//! rpc-gateway
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────┐
//!                      │                  GATEWAY                      │
//!   gRPC caller (h2)   │  ┌────────┐   ┌────────┐   ┌─────────────┐   │
//!   ───────────────────┼─▶│  net   │──▶│  http  │──▶│    call     │   │
//!                      │  │listener│   │ server │   │ coordinator │   │
//!                      │  └────────┘   └────────┘   └──┬───────┬──┘   │
//!                      │                              │       │      │   HTTP/1.1
//!                      │                     ┌────────▼──┐  ┌─▼──────┼──────────▶ decision
//!                      │                     │  backend  │  │decision│              service
//!                      │                     │   pool    │  │ client │
//!                      │                     └─────┬─────┘  └────────┘
//!                      │                           │ h2            │
//!                      └───────────────────────────┼──────────────┘
//!                                                  ▼
//!                                            backend servers
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rpc_gateway::config::load_config;
use rpc_gateway::lifecycle::shutdown_signal;
use rpc_gateway::net::Listener;
use rpc_gateway::observability::{init_logging, init_metrics};
use rpc_gateway::{GatewayServer, Shutdown};

#[derive(Parser)]
#[command(name = "rpc-gateway")]
#[command(about = "Security-gated gRPC gateway", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            return ExitCode::from(2);
        }
    };
    if args.check {
        println!("{}: ok", args.config.display());
        return ExitCode::SUCCESS;
    }

    init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        oracle = %config.oracle.endpoint,
        "rpc-gateway starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = match GatewayServer::new(&config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };
    let listener = match Listener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown.trigger();
    });

    if let Err(e) = server.run(listener, receiver).await {
        tracing::error!(error = %e, "Listener failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
