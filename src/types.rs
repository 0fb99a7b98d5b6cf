//! Basic type definitions for the hub
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based identifier of one live connection
//! - `UserId`: authenticated numeric user identity (many connections per user)
//! - `ChannelId`: broadcast group identifier
//! - `MessageId`: identifier of a stored chat message

use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. A reconnecting device always gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Authenticated user identity, resolved upstream before the handshake
    UserId
);

numeric_id!(
    /// Channel (broadcast group) identifier
    ChannelId
);

numeric_id!(
    /// Stored message identifier, assigned by the persistence layer
    MessageId
);

/// Parse a comma-separated channel list such as `"1, 7,42"`
///
/// Empty segments are skipped; any non-numeric segment fails the whole list.
pub fn parse_channel_list(raw: &str) -> Result<Vec<ChannelId>, ParseIntError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ChannelId::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        let id1 = ClientId::new();
        let id2 = ClientId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_user_id_parse() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn test_numeric_id_serializes_as_number() {
        let json = serde_json::to_string(&ChannelId(7)).unwrap();
        assert_eq!(json, "7");
        let id: MessageId = serde_json::from_str("99").unwrap();
        assert_eq!(id, MessageId(99));
    }

    #[test]
    fn test_parse_channel_list() {
        let list = parse_channel_list("1, 7,,42").unwrap();
        assert_eq!(list, vec![ChannelId(1), ChannelId(7), ChannelId(42)]);
        assert!(parse_channel_list("").unwrap().is_empty());
        assert!(parse_channel_list("1,x").is_err());
    }
}
