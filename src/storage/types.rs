//! Records shared by data owners, storage nodes and the ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Proof-of-possession scheme chosen per file at upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeAlgorithm {
    Merkle,
    Pairing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Good,
    Bad,
}

/// One encrypted copy of a slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Hex SEC1 public key of the holding node
    pub node_id: String,
    /// Hex SHA-256 of the ciphertext held by that node
    pub cipher_hash: String,
    pub cipher_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMeta {
    pub id: String,
    /// Position in the file, also the PDP index
    pub index: u64,
    /// Hex SHA-256 of the plaintext
    pub hash: String,
    pub length: u64,
    pub replicas: Vec<Replica>,
}

impl SliceMeta {
    pub fn holds(&self, node_id: &str) -> bool {
        self.replicas.iter().any(|r| r.node_id == node_id)
    }
}

/// Published description of a file; every change is a new version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub version: u64,
    pub owner_pubkey: String,
    pub name: String,
    pub ns: String,
    pub length: u64,
    /// Hex Merkle root over the plaintext slice hashes, in slice order
    pub merkle_root: String,
    pub slices: Vec<SliceMeta>,
    pub expire_at: DateTime<Utc>,
    /// Hex compressed G2 public key of the owner, pairing files only
    pub pdp_pubkey: Option<String>,
    pub challenge_algorithm: ChallengeAlgorithm,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Distinct node ids holding at least one replica, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slices
            .iter()
            .flat_map(|s| s.replicas.iter().map(|r| r.node_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Bytes the owner signs when publishing
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Hex SEC1 public key
    pub node_id: String,
    pub address: String,
    pub online: bool,
    pub health: Health,
    pub reg_time: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(node_id: &str, address: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            online: true,
            health: Health::Good,
            reg_time: Utc::now(),
            last_heartbeat: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.online && self.health == Health::Good
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        format!("register:{}:{}", self.node_id, self.address).into_bytes()
    }
}

/// Audit record of one challenge, published by the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub file_id: String,
    pub node_id: String,
    pub owner: String,
    pub algorithm: ChallengeAlgorithm,
    pub round: u64,
    pub passed: bool,
    /// Node health as judged by the owner after this outcome
    pub node_health: Health,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ProofBundle {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A plaintext block cut from an upload stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainSlice {
    pub id: String,
    pub index: u64,
    pub hash: [u8; 32],
    pub data: Vec<u8>,
}

/// Ciphertext of one slice for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSlice {
    pub slice_id: String,
    pub node_id: String,
    pub cipher_hash: [u8; 32],
    pub length: u64,
    pub ciphertext: Vec<u8>,
}

pub fn heartbeat_bytes(node_id: &str, timestamp: i64) -> Vec<u8> {
    format!("heartbeat:{}:{}", node_id, timestamp).into_bytes()
}

pub fn offline_bytes(node_id: &str) -> Vec<u8> {
    format!("offline:{}", node_id).into_bytes()
}
