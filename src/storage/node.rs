//! Storage node: holds slice ciphertext and answers challenges
//!
//! Blobs live under their slice id. Next to each blob the node keeps a
//! `<slice_id>.meta` record (owning file, index, owner key, PDP tags) and a
//! `<file_id>.slices` list, so pairing challenges can be answered by index.

use super::blob::BlobStore;
use super::chain::Ledger;
use super::challenger::merkle::{self, Interval};
use super::challenger::ReplicaTags;
use super::types::{heartbeat_bytes, offline_bytes, NodeRecord};
use crate::crypto::pdp::{self, PdpChallenge, PdpProof, ProofItem};
use crate::crypto::signer::{self, NodeKey};
use crate::crypto::{bytes_hex, sha256, vec_bytes_hex};
use crate::error::{DcpError, Result};
use crate::network::Handler;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StorageRequest {
    Push {
        file_id: String,
        slice_id: String,
        index: u64,
        /// Hex public key of the owner, checked against `signature`
        owner: String,
        #[serde(with = "bytes_hex")]
        data: Vec<u8>,
        tags: Option<ReplicaTags>,
        #[serde(with = "bytes_hex")]
        signature: Vec<u8>,
    },
    Pull {
        slice_id: String,
    },
    Exists {
        slice_id: String,
    },
    Delete {
        slice_id: String,
        #[serde(with = "bytes_hex")]
        signature: Vec<u8>,
    },
    MerkleChallenge {
        slice_id: String,
        intervals: Vec<Interval>,
    },
    PairingChallenge {
        file_id: String,
        challenge: PdpChallenge,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StorageResponse {
    Pushed,
    Data {
        #[serde(with = "bytes_hex")]
        data: Vec<u8>,
    },
    Exists {
        exists: bool,
    },
    Deleted,
    MerkleProof {
        #[serde(with = "vec_bytes_hex")]
        parts: Vec<Vec<u8>>,
    },
    PairingProof {
        proof: PdpProof,
    },
}

/// Bytes an owner signs to push a replica
pub fn push_bytes(file_id: &str, slice_id: &str, index: u64, data: &[u8]) -> Vec<u8> {
    format!("push:{}:{}:{}:{}", file_id, slice_id, index, hex::encode(sha256(data))).into_bytes()
}

pub fn delete_bytes(slice_id: &str) -> Vec<u8> {
    format!("delete:{}", slice_id).into_bytes()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSlice {
    file_id: String,
    slice_id: String,
    index: u64,
    owner: String,
    tags: Option<ReplicaTags>,
}

fn meta_key(slice_id: &str) -> String {
    format!("{}.meta", slice_id)
}

fn file_key(file_id: &str) -> String {
    format!("{}.slices", file_id)
}

pub struct StorageNode {
    key: NodeKey,
    address: String,
    blobs: Arc<dyn BlobStore>,
    /// Serializes updates of the per-file slice lists
    index_lock: Mutex<()>,
}

impl StorageNode {
    pub fn new(key: NodeKey, address: &str, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            key,
            address: address.to_string(),
            blobs,
            index_lock: Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> String {
        self.key.id_hex()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn register(&self, ledger: &dyn Ledger) -> Result<()> {
        let record = NodeRecord::new(&self.node_id(), &self.address);
        ledger
            .register_node(&record, &self.key.sign(&record.signing_bytes()))
            .await
    }

    fn meta(&self, slice_id: &str) -> Result<StoredSlice> {
        let bytes = self.blobs.get(&meta_key(slice_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn file_slices(&self, file_id: &str) -> Result<Vec<String>> {
        match self.blobs.get(&file_key(file_id)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(DcpError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write_file_slices(&self, file_id: &str, slices: &[String]) -> Result<()> {
        let key = file_key(file_id);
        if slices.is_empty() {
            return match self.blobs.delete(&key) {
                Ok(()) | Err(DcpError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }
        let bytes = serde_json::to_vec(slices)?;
        match self.blobs.update(&key, &bytes) {
            Err(DcpError::NotFound(_)) => self.blobs.put(&key, &bytes),
            other => other,
        }
    }

    fn push(&self, stored: StoredSlice, data: &[u8], signature: &[u8]) -> Result<()> {
        let owner = hex::decode(&stored.owner)?;
        let msg = push_bytes(&stored.file_id, &stored.slice_id, stored.index, data);
        if !signer::verify(&owner, &msg, signature)? {
            return Err(DcpError::Param(format!("bad push signature for slice {}", stored.slice_id)));
        }
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| DcpError::Internal("slice index poisoned".into()))?;
        self.blobs.put(&stored.slice_id, data)?;
        self.blobs
            .put(&meta_key(&stored.slice_id), &serde_json::to_vec(&stored)?)?;
        let mut slices = self.file_slices(&stored.file_id)?;
        slices.push(stored.slice_id.clone());
        self.write_file_slices(&stored.file_id, &slices)?;
        debug!(
            "[{}] stored slice {} #{} of {} ({} bytes)",
            self.address,
            stored.slice_id,
            stored.index,
            stored.file_id,
            data.len()
        );
        Ok(())
    }

    fn delete(&self, slice_id: &str, signature: &[u8]) -> Result<()> {
        let stored = self.meta(slice_id)?;
        let owner = hex::decode(&stored.owner)?;
        if !signer::verify(&owner, &delete_bytes(slice_id), signature)? {
            return Err(DcpError::Param(format!("bad delete signature for slice {}", slice_id)));
        }
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| DcpError::Internal("slice index poisoned".into()))?;
        self.blobs.delete(slice_id)?;
        self.blobs.delete(&meta_key(slice_id))?;
        let mut slices = self.file_slices(&stored.file_id)?;
        slices.retain(|s| s != slice_id);
        self.write_file_slices(&stored.file_id, &slices)?;
        debug!("[{}] deleted slice {}", self.address, slice_id);
        Ok(())
    }

    fn prove_pairing(&self, file_id: &str, challenge: &PdpChallenge) -> Result<PdpProof> {
        let mut held = Vec::new();
        for slice_id in self.file_slices(file_id)? {
            let meta = self.meta(&slice_id)?;
            if challenge.indices.contains(&meta.index) {
                let tags = meta
                    .tags
                    .ok_or_else(|| DcpError::NotFound(format!("sigma tags of slice {}", slice_id)))?;
                let tag = *tags.for_round(challenge.tag_round)?;
                held.push((meta.index, tag, self.blobs.get(&slice_id)?));
            }
        }
        let items: Vec<ProofItem<'_>> = held
            .iter()
            .map(|(index, tag, content)| ProofItem {
                index: *index,
                tag,
                content,
            })
            .collect();
        pdp::prove(challenge, &items)
    }

    /// Answer one request
    pub fn serve(&self, request: StorageRequest) -> Result<StorageResponse> {
        match request {
            StorageRequest::Push {
                file_id,
                slice_id,
                index,
                owner,
                data,
                tags,
                signature,
            } => {
                let stored = StoredSlice {
                    file_id,
                    slice_id,
                    index,
                    owner,
                    tags,
                };
                self.push(stored, &data, &signature)?;
                Ok(StorageResponse::Pushed)
            }
            StorageRequest::Pull { slice_id } => Ok(StorageResponse::Data {
                data: self.blobs.get(&slice_id)?,
            }),
            StorageRequest::Exists { slice_id } => Ok(StorageResponse::Exists {
                exists: self.blobs.exists(&slice_id)?,
            }),
            StorageRequest::Delete {
                slice_id,
                signature,
            } => {
                self.delete(&slice_id, &signature)?;
                Ok(StorageResponse::Deleted)
            }
            StorageRequest::MerkleChallenge {
                slice_id,
                intervals,
            } => {
                let data = self.blobs.get(&slice_id)?;
                Ok(StorageResponse::MerkleProof {
                    parts: merkle::extract(&data, &intervals)?,
                })
            }
            StorageRequest::PairingChallenge { file_id, challenge } => Ok(StorageResponse::PairingProof {
                proof: self.prove_pairing(&file_id, &challenge)?,
            }),
        }
    }

    /// Send heartbeats every `interval` until `shutdown` flips, then report
    /// the node offline
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        ledger: Arc<dyn Ledger>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let node_id = self.node_id();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ts = chrono::Utc::now().timestamp();
                        let sig = self.key.sign(&heartbeat_bytes(&node_id, ts));
                        if let Err(e) = ledger.heartbeat(&node_id, ts, &sig).await {
                            warn!("[{}] heartbeat failed: {}", self.address, e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let sig = self.key.sign(&offline_bytes(&node_id));
            if let Err(e) = ledger.node_offline(&node_id, &sig).await {
                warn!("[{}] offline report failed: {}", self.address, e);
            }
            info!("[{}] heartbeat stopped", self.address);
        })
    }
}

#[async_trait]
impl Handler for StorageNode {
    type Request = StorageRequest;
    type Response = StorageResponse;

    async fn handle(&self, from: &str, request: StorageRequest) -> Result<StorageResponse> {
        debug!("[{}] storage request from {}", self.address, from);
        self.serve(request)
    }
}
