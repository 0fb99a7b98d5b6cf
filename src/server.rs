//! Listener loop
//!
//! Accepts TCP connections and spawns one handler task per connection.
//! Owns nothing but shared handles: the hub handle, the admission
//! counter and the configuration.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::HubConfig;
use crate::connection_manager::ConnectionManager;
use crate::handler::handle_connection;
use crate::hub::HubHandle;

/// Shared state handed to every connection
#[derive(Debug, Clone)]
pub struct Server {
    hub: HubHandle,
    admission: Arc<ConnectionManager>,
    config: Arc<HubConfig>,
}

impl Server {
    pub fn new(hub: HubHandle, config: HubConfig) -> Self {
        let admission = Arc::new(ConnectionManager::new(
            config.max_connections_per_origin,
            config.rate_window(),
        ));
        Self {
            hub,
            admission,
            config: Arc::new(config),
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.hub.clone();
                        let admission = self.admission.clone();
                        let config = self.config.clone();

                        // Spawn handler task for each connection
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, hub, admission, config).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }

    /// Accept connections forever
    pub async fn run(self, listener: TcpListener) {
        self.run_until(listener, std::future::pending()).await;
    }
}
