use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::onchain::OnChainEvent;
use crate::username_proof::UserNameProof;

/// An event from the Hub's append-only log. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    /// Strictly increasing within a shard.
    pub id: u64,
    pub body: HubEventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEventBody {
    MergeMessage {
        message: Message,
        /// Messages the merge displaced on the Hub.
        #[serde(default)]
        deleted_messages: Vec<Message>,
    },
    PruneMessage {
        message: Message,
    },
    RevokeMessage {
        message: Message,
    },
    MergeOnChainEvent {
        on_chain_event: OnChainEvent,
    },
    MergeUsernameProof {
        #[serde(default)]
        username_proof: Option<UserNameProof>,
        #[serde(default)]
        deleted_username_proof: Option<UserNameProof>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEventType {
    MergeMessage,
    PruneMessage,
    RevokeMessage,
    MergeOnChainEvent,
    MergeUsernameProof,
}

impl fmt::Display for HubEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HubEventType::MergeMessage => "merge_message",
            HubEventType::PruneMessage => "prune_message",
            HubEventType::RevokeMessage => "revoke_message",
            HubEventType::MergeOnChainEvent => "merge_on_chain_event",
            HubEventType::MergeUsernameProof => "merge_username_proof",
        };
        f.write_str(name)
    }
}

impl HubEventType {
    /// The stored discriminant of the event type.
    pub fn code(self) -> i16 {
        match self {
            HubEventType::MergeMessage => 1,
            HubEventType::PruneMessage => 2,
            HubEventType::RevokeMessage => 3,
            HubEventType::MergeUsernameProof => 6,
            HubEventType::MergeOnChainEvent => 9,
        }
    }
}

impl HubEventBody {
    pub fn event_type(&self) -> HubEventType {
        match self {
            HubEventBody::MergeMessage { .. } => HubEventType::MergeMessage,
            HubEventBody::PruneMessage { .. } => HubEventType::PruneMessage,
            HubEventBody::RevokeMessage { .. } => HubEventType::RevokeMessage,
            HubEventBody::MergeOnChainEvent { .. } => HubEventType::MergeOnChainEvent,
            HubEventBody::MergeUsernameProof { .. } => HubEventType::MergeUsernameProof,
        }
    }

    /// The fid owning this body.
    ///
    /// Returns `None` only for a username proof event that carries neither a proof nor a
    /// displaced proof.
    pub fn fid(&self) -> Option<u64> {
        match self {
            HubEventBody::MergeMessage { message, .. }
            | HubEventBody::PruneMessage { message }
            | HubEventBody::RevokeMessage { message } => Some(message.fid),
            HubEventBody::MergeOnChainEvent { on_chain_event } => Some(on_chain_event.fid),
            HubEventBody::MergeUsernameProof {
                username_proof,
                deleted_username_proof,
            } => username_proof
                .as_ref()
                .or(deleted_username_proof.as_ref())
                .map(|proof| proof.fid),
        }
    }
}

impl HubEvent {
    pub fn new(id: u64, body: HubEventBody) -> Self {
        Self { id, body }
    }

    pub fn event_type(&self) -> HubEventType {
        self.body.event_type()
    }

    pub fn fid(&self) -> Option<u64> {
        self.body.fid()
    }
}
