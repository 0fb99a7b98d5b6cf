//! Error types for the hub
//!
//! Defines connection-level errors, inbound protocol errors,
//! configuration errors and the per-recipient delivery outcome.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Connection-level errors
///
/// Anything here ends the connection: the client is unregistered
/// and must reconnect from scratch.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error, including oversized frames (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The hub loop is gone (fatal - internal channel broken)
    #[error("Hub closed")]
    HubClosed,

    /// No frame (data or pong) arrived within the read deadline
    #[error("Read deadline expired")]
    ReadTimeout,

    /// An outbound frame could not be written within the write wait
    #[error("Write deadline expired")]
    WriteTimeout,
}

/// Inbound protocol errors
///
/// Local to a single frame: the offending client receives an `error`
/// envelope and the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or misses required fields
    #[error("Invalid message format: {0}")]
    Malformed(String),

    /// `type` discriminant is not a known command
    #[error("Unknown command type '{0}'")]
    UnknownType(String),

    /// Binary frames are not part of the protocol
    #[error("Binary frames are not supported")]
    Binary,

    /// Command targets a channel the client is not subscribed to
    #[error("Not subscribed to channel {0}")]
    NotSubscribed(crate::types::ChannelId),

    /// Message body is empty
    #[error("Message content is empty")]
    EmptyContent,

    /// Status a client may not set for itself (`offline` is derived from
    /// the connection count)
    #[error("Presence status '{0}' cannot be set by a client")]
    ReservedStatus(crate::presence::PresenceStatus),
}

/// Configuration errors, raised before the server starts
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A size, count or interval that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Read deadline must leave room for at least one heartbeat
    #[error("read deadline ({deadline}s) must exceed heartbeat interval ({heartbeat}s)")]
    DeadlineTooShort { deadline: u64, heartbeat: u64 },
}

/// Why a frame was not handed to a client's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    /// The bounded queue is saturated; the client is too slow
    #[error("outbound queue full")]
    QueueFull,

    /// The writer pump has already gone away
    #[error("outbound queue closed")]
    Closed,
}

/// Result of a single non-blocking send attempt to one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped(DropReason),
}
