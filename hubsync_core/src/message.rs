//! Hub messages and the state they move through in the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw bytes rendered as `0x`-prefixed hex in logs and serialized as hex in payloads.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexBytes(#[serde(with = "hex::serde")] pub Vec<u8>);

impl HexBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for HexBytes {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(digits).map(Self)
    }
}

/// The hash identifying a message within its fid.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHash(pub HexBytes);

impl MessageHash {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<Vec<u8>> for MessageHash {
    fn from(bytes: Vec<u8>) -> Self {
        Self(HexBytes(bytes))
    }
}

impl From<&[u8]> for MessageHash {
    fn from(bytes: &[u8]) -> Self {
        Self(HexBytes::from(bytes))
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHash({})", self.0)
    }
}

impl FromStr for MessageHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// The Farcaster message types, with their protocol discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MessageType {
    CastAdd = 1,
    CastRemove = 2,
    ReactionAdd = 3,
    ReactionRemove = 4,
    LinkAdd = 5,
    LinkRemove = 6,
    VerificationAddEthAddress = 7,
    VerificationRemove = 8,
    UserDataAdd = 11,
    UsernameProof = 12,
    FrameAction = 13,
    LinkCompactState = 14,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::CastAdd,
        MessageType::CastRemove,
        MessageType::ReactionAdd,
        MessageType::ReactionRemove,
        MessageType::LinkAdd,
        MessageType::LinkRemove,
        MessageType::VerificationAddEthAddress,
        MessageType::VerificationRemove,
        MessageType::UserDataAdd,
        MessageType::UsernameProof,
        MessageType::FrameAction,
        MessageType::LinkCompactState,
    ];

    /// The protocol discriminant, as stored in the `message_type` column.
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// The message kind this type belongs to, if it is reconciled by kind.
    pub fn kind(self) -> Option<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.message_types().contains(&self))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::CastAdd => "cast_add",
            MessageType::CastRemove => "cast_remove",
            MessageType::ReactionAdd => "reaction_add",
            MessageType::ReactionRemove => "reaction_remove",
            MessageType::LinkAdd => "link_add",
            MessageType::LinkRemove => "link_remove",
            MessageType::VerificationAddEthAddress => "verification_add_eth_address",
            MessageType::VerificationRemove => "verification_remove",
            MessageType::UserDataAdd => "user_data_add",
            MessageType::UsernameProof => "username_proof",
            MessageType::FrameAction => "frame_action",
            MessageType::LinkCompactState => "link_compact_state",
        };
        f.write_str(name)
    }
}

/// A family of message types queried together from the Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Casts,
    Reactions,
    Links,
    Verifications,
    UserData,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Casts,
        MessageKind::Reactions,
        MessageKind::Links,
        MessageKind::Verifications,
        MessageKind::UserData,
    ];

    pub fn message_types(self) -> &'static [MessageType] {
        match self {
            MessageKind::Casts => &[MessageType::CastAdd, MessageType::CastRemove],
            MessageKind::Reactions => &[MessageType::ReactionAdd, MessageType::ReactionRemove],
            MessageKind::Links => &[
                MessageType::LinkAdd,
                MessageType::LinkRemove,
                MessageType::LinkCompactState,
            ],
            MessageKind::Verifications => &[
                MessageType::VerificationAddEthAddress,
                MessageType::VerificationRemove,
            ],
            MessageKind::UserData => &[MessageType::UserDataAdd],
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Casts => "casts",
            MessageKind::Reactions => "reactions",
            MessageKind::Links => "links",
            MessageKind::Verifications => "verifications",
            MessageKind::UserData => "user_data",
        };
        f.write_str(name)
    }
}

/// A message as emitted by the Hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub hash: MessageHash,
    pub fid: u64,
    pub message_type: MessageType,
    /// Farcaster-epoch seconds.
    pub timestamp: u32,
    /// Application payload. Opaque to the sync engine.
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Whether a stored message is live or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Created,
    Deleted,
}

/// The write performed on a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreMessageOperation {
    Merge,
    Delete,
}

/// Why a message was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteReason {
    /// The Hub pruned the message to stay within storage limits.
    Pruned,
    /// The signer of the message was revoked.
    Revoked,
    /// A later message displaced it (remove over add, newer user data).
    Displaced,
}

/// A message row as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    pub deleted_at: Option<DateTime<Utc>>,
    pub pruned_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// A live row for `message`.
    pub fn created(message: Message) -> Self {
        Self {
            message,
            deleted_at: None,
            pruned_at: None,
            revoked_at: None,
        }
    }

    pub fn state(&self) -> MessageState {
        if self.deleted_at.is_some() {
            MessageState::Deleted
        } else {
            MessageState::Created
        }
    }

    /// Marks the row deleted at `at`, returning whether `deleted_at` moved from null to set.
    pub fn mark_deleted(&mut self, reason: DeleteReason, at: DateTime<Utc>) -> bool {
        match reason {
            DeleteReason::Pruned => {
                self.pruned_at.get_or_insert(at);
            }
            DeleteReason::Revoked => {
                self.revoked_at.get_or_insert(at);
            }
            DeleteReason::Displaced => {}
        }
        if self.deleted_at.is_some() {
            return false;
        }
        self.deleted_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(hash: u8) -> Message {
        Message {
            hash: MessageHash::from(vec![hash; 4]),
            fid: 7,
            message_type: MessageType::CastAdd,
            timestamp: 100,
            body: serde_json::json!({ "text": "gm" }),
        }
    }

    #[test]
    fn message_hash_displays_and_parses_as_hex() {
        let hash = MessageHash::from(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(hash.to_string(), "0xdeadbeef");
        assert_eq!("0xdeadbeef".parse::<MessageHash>().unwrap(), hash);
        assert_eq!("deadbeef".parse::<MessageHash>().unwrap(), hash);
        assert!("0xzz".parse::<MessageHash>().is_err());
    }

    #[test]
    fn message_serializes_hash_as_hex() {
        let json = serde_json::to_value(cast(1)).unwrap();
        assert_eq!(json["hash"], "01010101");
        assert_eq!(json["message_type"], "cast_add");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, cast(1));
    }

    #[test]
    fn message_type_codes_match_the_protocol() {
        assert_eq!(MessageType::CastAdd.code(), 1);
        assert_eq!(MessageType::UserDataAdd.code(), 11);
        assert_eq!(MessageType::from_code(14), Some(MessageType::LinkCompactState));
        assert_eq!(MessageType::from_code(9), None);
    }

    #[test]
    fn every_reconciled_type_belongs_to_exactly_one_kind() {
        for kind in MessageKind::ALL {
            for message_type in kind.message_types() {
                assert_eq!(message_type.kind(), Some(kind));
            }
        }
        assert_eq!(MessageType::UsernameProof.kind(), None);
        assert_eq!(MessageType::FrameAction.kind(), None);
    }

    #[test]
    fn deleting_twice_only_reports_the_first_transition() {
        let mut stored = StoredMessage::created(cast(1));
        assert_eq!(stored.state(), MessageState::Created);

        let first = Utc::now();
        assert!(stored.mark_deleted(DeleteReason::Pruned, first));
        assert!(!stored.mark_deleted(DeleteReason::Pruned, Utc::now()));
        assert_eq!(stored.state(), MessageState::Deleted);
        assert_eq!(stored.deleted_at, Some(first));
        assert_eq!(stored.pruned_at, Some(first));
        assert_eq!(stored.revoked_at, None);
    }

    #[test]
    fn revoking_a_pruned_message_records_both_reasons() {
        let mut stored = StoredMessage::created(cast(2));
        stored.mark_deleted(DeleteReason::Pruned, Utc::now());
        assert!(!stored.mark_deleted(DeleteReason::Revoked, Utc::now()));
        assert!(stored.pruned_at.is_some());
        assert!(stored.revoked_at.is_some());
    }
}
