//! stress-echo: an echo server under synthetic load, and a client to drive it
//!
//! Two roles in one binary:
//! - `server`: TCP echo server that also runs CPU and memory stressors
//! - `client`: connects repeatedly, sends a payload and prints the reply
//!
//! Features:
//! - One task per connection, bounded by a connection limit
//! - Configurable CPU spinners and memory growth, with optional memory cap
//! - Retry on refused connections
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod load;
mod server;

use client::StressClient;
use config::{Config, Role};
use load::LoadGenerator;
use server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Server => run_server(config).await,
        Role::Client => run_client(config).await,
    }
}

/// Start the load workers, then serve echo until Ctrl-C
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.server.listen,
        max_connections = config.server.max_connections,
        load = config.load.enabled,
        max_memory_mb = config.load.max_memory / 1024 / 1024,
        "Starting stress-echo server"
    );

    let server = Server::new(config.server.clone());
    let listener = server.bind()?;
    let load = LoadGenerator::start(&config.load)?;

    let reporter = if config.server.report_interval > 0 {
        Some(tokio::spawn(server::report_task(
            server.stats().clone(),
            load.stats_handle(),
            config.server.report_interval,
        )))
    } else {
        None
    };

    info!(address = %listener.local_addr()?, "Stress server is running");
    server.run(listener, shutdown_signal()).await?;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let load_stats = tokio::task::spawn_blocking(move || load.stop()).await?;
    let echo_stats = server.stats().snapshot();
    info!(
        accepted = echo_stats.accepted,
        bytes_echoed = echo_stats.bytes_echoed,
        cpu_rounds = load_stats.cpu_rounds,
        allocations = load_stats.allocations,
        "Server shut down"
    );
    Ok(())
}

/// Run the stress client until its duration elapses or Ctrl-C
async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = StressClient::new(config.client);

    tokio::select! {
        report = client.run() => {
            let report = report?;
            info!(
                attempts = report.attempts,
                replies = report.replies,
                refused = report.refused,
                bytes_sent = report.bytes_sent,
                bytes_received = report.bytes_received,
                "Stress test completed"
            );
        }
        _ = shutdown_signal() => {
            info!("Interrupted");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
