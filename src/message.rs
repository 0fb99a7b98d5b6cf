//! Message protocol definitions
//!
//! JSON-based bidirectional protocol. Inbound frames are a `type`/`data`
//! envelope decoded in two steps so an unknown `type` can be told apart
//! from a malformed payload. Outbound envelopes are a closed tagged enum.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::presence::{PresenceRecord, PresenceStatus};
use crate::types::{ChannelId, MessageId, UserId};

/// One outbound frame as queued for a client; shared across a fan-out
pub type Frame = Arc<ServerMessage>;

/// Current time as Unix seconds
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// File reference attached to a chat message (uploads are handled elsewhere)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub channel_id: ChannelId,
    pub content: String,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub status: PresenceStatus,
    #[serde(default)]
    pub status_msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub channel_id: ChannelId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub message_sender_id: UserId,
}

/// Client → Hub command
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(ChannelPayload),
    Unsubscribe(ChannelPayload),
    SendMessage(SendMessagePayload),
    UpdatePresence(PresencePayload),
    Typing(TypingPayload),
    ReadReceipt(ReadReceiptPayload),
}

impl ClientCommand {
    /// Wire name of the command, echoed back in `ack`
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::Subscribe(_) => "channel_subscribe",
            ClientCommand::Unsubscribe(_) => "channel_unsubscribe",
            ClientCommand::SendMessage(_) => "message",
            ClientCommand::UpdatePresence(_) => "presence_update",
            ClientCommand::Typing(_) => "typing",
            ClientCommand::ReadReceipt(_) => "read_receipt",
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// A decoded inbound frame
///
/// Keeps the raw `data` object so the hub can echo it in the `ack`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub command: ClientCommand,
    pub data: serde_json::Value,
    pub timestamp: Option<i64>,
}

impl InboundFrame {
    /// Decode a text frame into a typed command
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let command = match raw.kind.as_str() {
            "channel_subscribe" => ClientCommand::Subscribe(payload(&raw.data)?),
            "channel_unsubscribe" => ClientCommand::Unsubscribe(payload(&raw.data)?),
            "message" => ClientCommand::SendMessage(payload(&raw.data)?),
            "presence_update" => ClientCommand::UpdatePresence(payload(&raw.data)?),
            "typing" => ClientCommand::Typing(payload(&raw.data)?),
            "read_receipt" => ClientCommand::ReadReceipt(payload(&raw.data)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok(Self {
            command,
            data: raw.data,
            timestamp: raw.timestamp,
        })
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: &serde_json::Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Body of an outbound `message` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub content: String,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

/// One roster row inside `bulk_presence`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    pub last_seen: i64,
}

impl From<&PresenceRecord> for PresenceEntry {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id,
            status: record.status,
            status_msg: non_empty(&record.status_message),
            last_seen: record.last_seen.timestamp(),
        }
    }
}

/// Body of an `ack` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckData {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Hub → Client envelope, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Chat message fanned out to a channel
    Message {
        channel_id: ChannelId,
        data: MessageData,
        timestamp: i64,
    },
    /// Typing indicator from another channel member
    Typing {
        user_id: UserId,
        channel_id: ChannelId,
        is_typing: bool,
        timestamp: i64,
    },
    /// Presence transition of one user
    Presence {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_msg: Option<String>,
        timestamp: i64,
    },
    /// Full roster snapshot sent on registration
    BulkPresence {
        presences: Vec<PresenceEntry>,
        timestamp: i64,
    },
    /// A message sent by this user was read
    ReadReceipt {
        message_id: MessageId,
        channel_id: ChannelId,
        user_id: UserId,
        message_sender_id: UserId,
        timestamp: i64,
    },
    /// Error occurred
    Error { code: ErrorCode, message: String },
    /// Inbound command accepted
    Ack { data: AckData },
}

impl ServerMessage {
    pub fn chat(
        channel_id: ChannelId,
        sender_id: UserId,
        content: String,
        attachments: Option<Vec<Attachment>>,
    ) -> Self {
        ServerMessage::Message {
            channel_id,
            data: MessageData {
                content,
                sender_id,
                message_id: None,
                attachments,
            },
            timestamp: now_unix(),
        }
    }

    /// Envelope for a "message stored" event from the persistence layer
    pub fn stored_message(
        message_id: MessageId,
        channel_id: ChannelId,
        sender_id: UserId,
        content: String,
        attachments: Option<Vec<Attachment>>,
    ) -> Self {
        ServerMessage::Message {
            channel_id,
            data: MessageData {
                content,
                sender_id,
                message_id: Some(message_id),
                attachments,
            },
            timestamp: now_unix(),
        }
    }

    pub fn typing(user_id: UserId, channel_id: ChannelId, is_typing: bool) -> Self {
        ServerMessage::Typing {
            user_id,
            channel_id,
            is_typing,
            timestamp: now_unix(),
        }
    }

    pub fn presence(record: &PresenceRecord) -> Self {
        ServerMessage::Presence {
            user_id: record.user_id,
            status: record.status,
            status_msg: non_empty(&record.status_message),
            timestamp: now_unix(),
        }
    }

    pub fn read_receipt(
        message_id: MessageId,
        channel_id: ChannelId,
        reader: UserId,
        sender: UserId,
    ) -> Self {
        ServerMessage::ReadReceipt {
            message_id,
            channel_id,
            user_id: reader,
            message_sender_id: sender,
            timestamp: now_unix(),
        }
    }

    pub fn ack(kind: &str, data: serde_json::Value) -> Self {
        ServerMessage::Ack {
            data: AckData {
                kind: kind.to_string(),
                data,
            },
        }
    }

    /// Wire name of the envelope
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Message { .. } => "message",
            ServerMessage::Typing { .. } => "typing",
            ServerMessage::Presence { .. } => "presence",
            ServerMessage::BulkPresence { .. } => "bulk_presence",
            ServerMessage::ReadReceipt { .. } => "read_receipt",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Ack { .. } => "ack",
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be decoded
    InvalidMessage,
    /// Unrecognized command `type`
    UnknownCommand,
    /// Binary or otherwise unsupported frame
    UnsupportedFrame,
    /// Command targets a channel the client has not joined
    NotSubscribed,
    /// Message content is empty
    EmptyContent,
}

/// Convert ProtocolError to ServerMessage for client notification
impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::Malformed(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownCommand,
            ProtocolError::Binary => ErrorCode::UnsupportedFrame,
            ProtocolError::NotSubscribed(_) => ErrorCode::NotSubscribed,
            ProtocolError::EmptyContent => ErrorCode::EmptyContent,
            ProtocolError::ReservedStatus(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::Error {
            code,
            message: err.to_string(),
        }
    }
}
