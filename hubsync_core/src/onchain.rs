//! On-chain events relayed by the Hub.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::HexBytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnChainEventType {
    Signer,
    SignerMigrated,
    IdRegister,
    StorageRent,
}

impl OnChainEventType {
    /// The protocol discriminant, as stored in the `event_type` column.
    pub fn code(self) -> i16 {
        match self {
            OnChainEventType::Signer => 1,
            OnChainEventType::SignerMigrated => 2,
            OnChainEventType::IdRegister => 3,
            OnChainEventType::StorageRent => 4,
        }
    }
}

impl fmt::Display for OnChainEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OnChainEventType::Signer => "signer",
            OnChainEventType::SignerMigrated => "signer_migrated",
            OnChainEventType::IdRegister => "id_register",
            OnChainEventType::StorageRent => "storage_rent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerEventType {
    Add,
    Remove,
    AdminReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdRegisterEventType {
    Register,
    Transfer,
    ChangeRecovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnChainEventBody {
    Signer {
        key: HexBytes,
        key_type: u32,
        event_type: SignerEventType,
        #[serde(default)]
        metadata: HexBytes,
    },
    SignerMigrated {
        migrated_at: u32,
    },
    IdRegister {
        to: HexBytes,
        event_type: IdRegisterEventType,
        #[serde(default)]
        from: HexBytes,
        #[serde(default)]
        recovery_address: HexBytes,
    },
    StorageRent {
        payer: HexBytes,
        units: u32,
        expiry: u32,
    },
}

impl OnChainEventBody {
    pub fn event_type(&self) -> OnChainEventType {
        match self {
            OnChainEventBody::Signer { .. } => OnChainEventType::Signer,
            OnChainEventBody::SignerMigrated { .. } => OnChainEventType::SignerMigrated,
            OnChainEventBody::IdRegister { .. } => OnChainEventType::IdRegister,
            OnChainEventBody::StorageRent { .. } => OnChainEventType::StorageRent,
        }
    }
}

/// An on-chain event. Append-only, identified by [`OnChainEventKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainEvent {
    pub chain_id: u32,
    pub block_number: u64,
    pub block_hash: HexBytes,
    pub block_timestamp: u64,
    pub tx_hash: HexBytes,
    pub log_index: u32,
    pub tx_index: u32,
    pub fid: u64,
    pub body: OnChainEventBody,
}

impl OnChainEvent {
    pub fn event_type(&self) -> OnChainEventType {
        self.body.event_type()
    }

    pub fn key(&self) -> OnChainEventKey {
        OnChainEventKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnChainEventKey {
    pub chain_id: u32,
    pub tx_hash: HexBytes,
    pub log_index: u32,
}
