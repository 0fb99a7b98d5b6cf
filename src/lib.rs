//! Real-time messaging hub
//!
//! An in-memory dispatcher that fans out chat messages, presence changes,
//! typing indicators and read receipts to connected WebSocket clients.
//!
//! # Features
//! - Per-channel and per-user (multi-device) fan-out
//! - Hub-wide presence with an initial roster snapshot on connect
//! - Typing indicators that skip the typing user's own devices
//! - Read receipts delivered only to the message's sender
//! - Per-origin connection limits checked before the upgrade
//! - Slow consumers dropped instead of stalling the dispatcher
//! - Heartbeats, read deadlines and idle-client eviction
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning every registry and the presence table
//! - Each connection runs a reader and a writer pump talking to the hub
//!   only through a `HubHandle`
//! - No locks on the hub's state - commands are applied one at a time
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chat_hub::{Hub, HubConfig, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HubConfig::default();
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (hub, _join) = Hub::spawn(config.clone()).expect("valid config");
//!
//!     Server::new(hub, config).run(listener).await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod presence;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::HubConfig;
pub use connection_manager::{ConnectionManager, OriginSlot};
pub use error::{AppError, ConfigError, DeliveryOutcome, DropReason, ProtocolError};
pub use handler::{handle_connection, CHANNELS_HEADER, USER_ID_HEADER};
pub use hub::{DisconnectReason, Hub, HubCommand, HubHandle, HubStats};
pub use message::{ClientCommand, ErrorCode, Frame, InboundFrame, ServerMessage};
pub use presence::{PresenceRecord, PresenceStatus, PresenceTracker};
pub use server::Server;
pub use types::{ChannelId, ClientId, MessageId, UserId};
