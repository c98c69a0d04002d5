//! Username proofs (fnames and ENS names).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::HexBytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserNameType {
    Fname,
    EnsL1,
}

impl UserNameType {
    pub const ALL: [UserNameType; 2] = [UserNameType::Fname, UserNameType::EnsL1];

    pub fn code(self) -> i16 {
        match self {
            UserNameType::Fname => 1,
            UserNameType::EnsL1 => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for UserNameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserNameType::Fname => f.write_str("fname"),
            UserNameType::EnsL1 => f.write_str("ens_l1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNameProof {
    pub name: String,
    pub fid: u64,
    pub owner: HexBytes,
    pub proof_type: UserNameType,
    /// Unix seconds.
    pub timestamp: i64,
    pub signature: HexBytes,
}

impl UserNameProof {
    /// The reconciliation identity of this proof. The timestamp is not part of it.
    pub fn key(&self) -> ProofKey {
        ProofKey {
            name: self.name.clone(),
            owner: self.owner.clone(),
            fid: self.fid,
            proof_type: self.proof_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProofKey {
    pub name: String,
    pub owner: HexBytes,
    pub fid: u64,
    pub proof_type: UserNameType,
}

/// A username proof row as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUsernameProof {
    pub proof: UserNameProof,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredUsernameProof {
    pub fn live(proof: UserNameProof) -> Self {
        Self {
            proof,
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(timestamp: i64) -> UserNameProof {
        UserNameProof {
            name: "alice".to_string(),
            fid: 3,
            owner: HexBytes(vec![0x11; 20]),
            proof_type: UserNameType::Fname,
            timestamp,
            signature: HexBytes(vec![0x22; 65]),
        }
    }

    #[test]
    fn key_ignores_timestamp_and_signature() {
        let mut other = proof(200);
        other.signature = HexBytes(vec![0x33]);
        assert_eq!(proof(100).key(), other.key());
    }

    #[test]
    fn key_distinguishes_owner() {
        let mut other = proof(100);
        other.owner = HexBytes(vec![0x44; 20]);
        assert_ne!(proof(100).key(), other.key());
    }

    #[test]
    fn proof_type_codes_round_trip() {
        for proof_type in UserNameType::ALL {
            assert_eq!(UserNameType::from_code(proof_type.code()), Some(proof_type));
        }
        assert_eq!(UserNameType::from_code(0), None);
    }
}
