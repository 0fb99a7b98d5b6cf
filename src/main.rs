//! Messaging hub - Entry Point
//!
//! Parses the command line, starts the Hub actor and accepts connections
//! until Ctrl-C.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_hub::{Hub, HubConfig, Server};

/// Real-time messaging hub
#[derive(Debug, Parser)]
#[command(name = "chat_hub", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(default_value = "127.0.0.1:8080", env = "HUB_ADDR")]
    addr: String,

    /// Connections allowed per origin IP within one rate window
    #[arg(long, env = "HUB_MAX_CONNECTIONS_PER_ORIGIN", default_value_t = 50)]
    max_connections_per_origin: u32,

    /// Rate window in seconds
    #[arg(long, env = "HUB_RATE_WINDOW_SECS", default_value_t = 300)]
    rate_window_secs: u64,

    /// Outbound frames buffered per client
    #[arg(long, env = "HUB_CLIENT_QUEUE_SIZE", default_value_t = 256)]
    client_queue_size: usize,

    /// Depth of the hub's command queue
    #[arg(long, env = "HUB_COMMAND_QUEUE_SIZE", default_value_t = 1024)]
    command_queue_size: usize,

    /// Idle seconds before a client is evicted
    #[arg(long, env = "HUB_INACTIVITY_TIMEOUT_SECS", default_value_t = 600)]
    inactivity_timeout_secs: u64,

    /// Seconds between cleanup passes
    #[arg(long, env = "HUB_CLEANUP_INTERVAL_SECS", default_value_t = 120)]
    cleanup_interval_secs: u64,

    /// Seconds between pings
    #[arg(long, env = "HUB_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    /// Seconds allowed between inbound frames
    #[arg(long, env = "HUB_READ_DEADLINE_SECS", default_value_t = 60)]
    read_deadline_secs: u64,

    /// Seconds allowed for writing one outbound frame
    #[arg(long, env = "HUB_WRITE_WAIT_SECS", default_value_t = 10)]
    write_wait_secs: u64,

    /// Largest inbound frame in bytes
    #[arg(long, env = "HUB_MAX_FRAME_SIZE", default_value_t = 512 * 1024)]
    max_frame_size: usize,

    /// Seconds to keep offline presence records
    #[arg(long, env = "HUB_PRESENCE_RETENTION_SECS", default_value_t = 86_400)]
    presence_retention_secs: u64,
}

impl Cli {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections_per_origin: self.max_connections_per_origin,
            rate_window_secs: self.rate_window_secs,
            client_queue_size: self.client_queue_size,
            command_queue_size: self.command_queue_size,
            inactivity_timeout_secs: self.inactivity_timeout_secs,
            cleanup_interval_secs: self.cleanup_interval_secs,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            read_deadline_secs: self.read_deadline_secs,
            write_wait_secs: self.write_wait_secs,
            max_frame_size: self.max_frame_size,
            presence_retention_secs: self.presence_retention_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.hub_config();

    // Start the Hub actor; refuses an invalid configuration
    let (hub, hub_task) = Hub::spawn(config.clone()).map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;
    info!(?config, "Hub actor started");

    // Start TCP listener
    let listener = TcpListener::bind(&cli.addr).await?;
    info!("Messaging hub listening on {}", cli.addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    Server::new(hub, config).run_until(listener, shutdown).await;

    // Connection tasks still hold handles; give the hub a moment to drain
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), hub_task).await;
    info!("Shutdown complete");

    Ok(())
}
