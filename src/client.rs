//! Client struct definition
//!
//! Represents one registered connection: who it belongs to, which channels
//! it listens on, and the bounded queue feeding its writer pump.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{DeliveryOutcome, DropReason};
use crate::message::Frame;
use crate::types::{ChannelId, ClientId, UserId};

/// Registered connection state
///
/// Owned by the hub registry. The connection's pumps only hold the
/// receiving ends of `sender` and the close signal; dropping the client
/// closes the connection without waiting for the queue to drain.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Authenticated owner
    pub user_id: UserId,
    /// Channels this connection receives broadcasts for
    pub channels: HashSet<ChannelId>,
    /// Remote address, for logging
    pub origin: String,
    /// Hub → Client frame queue
    sender: mpsc::Sender<Frame>,
    /// Last inbound frame (or registration) time
    pub last_activity: Instant,
    /// Wall-clock connect time
    pub connected_at: DateTime<Utc>,
    /// Free-form per-connection attributes (user agent, device, ...)
    pub metadata: HashMap<String, serde_json::Value>,
    /// Dropped with the client, which wakes the connection's close watcher
    _close: Option<oneshot::Sender<()>>,
}

impl Client {
    /// Create a new client with the given identity and frame queue
    pub fn new(user_id: UserId, origin: impl Into<String>, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id: ClientId::new(),
            user_id,
            channels: HashSet::new(),
            origin: origin.into(),
            sender,
            last_activity: Instant::now(),
            connected_at: Utc::now(),
            metadata: HashMap::new(),
            _close: None,
        }
    }

    /// Channels to join as part of registration
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Queue a frame without waiting
    ///
    /// A full queue means the peer is not keeping up; the caller is
    /// expected to unregister the client.
    pub fn try_deliver(&self, frame: Frame) -> DeliveryOutcome {
        match self.sender.try_send(frame) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Dropped(DropReason::QueueFull),
            Err(TrySendError::Closed(_)) => DeliveryOutcome::Dropped(DropReason::Closed),
        }
    }

    /// Signal whose receiver resolves once the hub drops this client
    pub fn with_close_signal(mut self, close: oneshot::Sender<()>) -> Self {
        self._close = Some(close);
        self
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_subscribed(&self, channel_id: ChannelId) -> bool {
        self.channels.contains(&channel_id)
    }
}
