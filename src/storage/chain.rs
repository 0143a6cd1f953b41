//! Ledger adapter contract and an in-process ledger
//!
//! The ledger is the shared source of truth for file records and storage
//! node records. Writes are signed: file records and challenge bundles by
//! the owner, node records and heartbeats by the node itself.

use super::types::{heartbeat_bytes, offline_bytes, FileRecord, Health, NodeRecord, ProofBundle};
use crate::crypto::signer;
use crate::error::{DcpError, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Publish a new file or a new version of it
    async fn publish_file(&self, record: &FileRecord, signature: &[u8]) -> Result<()>;
    async fn get_file(&self, file_id: &str) -> Result<FileRecord>;
    async fn list_files_by_namespace(&self, ns: &str, offset: usize, limit: usize) -> Result<Vec<FileRecord>>;
    async fn register_node(&self, record: &NodeRecord, signature: &[u8]) -> Result<()>;
    async fn heartbeat(&self, node_id: &str, timestamp: i64, signature: &[u8]) -> Result<()>;
    async fn node_offline(&self, node_id: &str, signature: &[u8]) -> Result<()>;
    /// Record a challenge outcome for audit
    async fn challenge_response(&self, bundle: &ProofBundle, signature: &[u8]) -> Result<()>;
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    files: BTreeMap<String, FileRecord>,
    nodes: BTreeMap<String, NodeRecord>,
    challenges: Vec<ProofBundle>,
}

/// Ledger held in memory, optionally mirrored to a JSON file
#[derive(Debug)]
pub struct MemoryChain {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
    heartbeat_interval: Duration,
}

fn check_signature(public_hex: &str, msg: &[u8], signature: &[u8]) -> Result<()> {
    let public = hex::decode(public_hex)?;
    if signer::verify(&public, msg, signature)? {
        Ok(())
    } else {
        Err(DcpError::Param(format!("bad signature from {}", public_hex)))
    }
}

impl MemoryChain {
    /// Nodes whose last heartbeat is older than three intervals are offline
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            path: None,
            heartbeat_interval,
        }
    }

    /// Ledger shared through a JSON file: reloaded before every operation,
    /// saved after every write
    pub fn open(path: &Path, heartbeat_interval: Duration) -> Result<Self> {
        let state = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            LedgerState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
            heartbeat_interval,
        })
    }

    fn with_state<T>(&self, write: bool, f: impl FnOnce(&mut LedgerState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DcpError::Internal("ledger state poisoned".into()))?;
        if let Some(path) = self.path.as_ref().filter(|p| p.exists()) {
            *state = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        }
        let out = f(&mut state)?;
        if write {
            if let Some(path) = &self.path {
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, serde_json::to_string_pretty(&*state)?)?;
                std::fs::rename(&tmp, path)?;
            }
        }
        Ok(out)
    }

    /// Challenge outcomes recorded so far
    pub fn challenges(&self) -> Vec<ProofBundle> {
        self.state
            .lock()
            .map(|s| s.challenges.clone())
            .unwrap_or_default()
    }

    fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.heartbeat_interval * 3).unwrap_or_else(|_| ChronoDuration::days(36_500))
    }
}

#[async_trait]
impl Ledger for MemoryChain {
    async fn publish_file(&self, record: &FileRecord, signature: &[u8]) -> Result<()> {
        check_signature(&record.owner_pubkey, &record.signing_bytes()?, signature)?;
        self.with_state(true, |state| {
            let expected = match state.files.get(&record.file_id) {
                Some(prev) if prev.owner_pubkey != record.owner_pubkey => {
                    return Err(DcpError::Param(format!(
                        "file {} belongs to another owner",
                        record.file_id
                    )))
                }
                Some(prev) => prev.version + 1,
                None => 1,
            };
            if record.version != expected {
                return Err(DcpError::Param(format!(
                    "file {} version {} is not the next version {}",
                    record.file_id, record.version, expected
                )));
            }
            info!("[{}] published version {}", record.file_id, record.version);
            state.files.insert(record.file_id.clone(), record.clone());
            Ok(())
        })
    }

    async fn get_file(&self, file_id: &str) -> Result<FileRecord> {
        self.with_state(false, |state| {
            state
                .files
                .get(file_id)
                .cloned()
                .ok_or_else(|| DcpError::NotFound(format!("file {}", file_id)))
        })
    }

    async fn list_files_by_namespace(&self, ns: &str, offset: usize, limit: usize) -> Result<Vec<FileRecord>> {
        self.with_state(false, |state| {
            Ok(state
                .files
                .values()
                .filter(|f| f.ns == ns)
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn register_node(&self, record: &NodeRecord, signature: &[u8]) -> Result<()> {
        check_signature(&record.node_id, &record.signing_bytes(), signature)?;
        self.with_state(true, |state| {
            let mut record = record.clone();
            record.online = true;
            record.last_heartbeat = Some(Utc::now());
            if let Some(prev) = state.nodes.get(&record.node_id) {
                record.health = prev.health;
                record.reg_time = prev.reg_time;
            }
            info!("registered storage node {} at {}", record.node_id, record.address);
            state.nodes.insert(record.node_id.clone(), record);
            Ok(())
        })
    }

    async fn heartbeat(&self, node_id: &str, timestamp: i64, signature: &[u8]) -> Result<()> {
        check_signature(node_id, &heartbeat_bytes(node_id, timestamp), signature)?;
        let at = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| DcpError::Param(format!("bad heartbeat timestamp {}", timestamp)))?;
        self.with_state(true, |state| {
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| DcpError::NotFound(format!("node {}", node_id)))?;
            node.last_heartbeat = Some(at);
            node.online = true;
            debug!("heartbeat from {}", node_id);
            Ok(())
        })
    }

    async fn node_offline(&self, node_id: &str, signature: &[u8]) -> Result<()> {
        check_signature(node_id, &offline_bytes(node_id), signature)?;
        self.with_state(true, |state| {
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| DcpError::NotFound(format!("node {}", node_id)))?;
            node.online = false;
            info!("storage node {} went offline", node_id);
            Ok(())
        })
    }

    async fn challenge_response(&self, bundle: &ProofBundle, signature: &[u8]) -> Result<()> {
        check_signature(&bundle.owner, &bundle.signing_bytes()?, signature)?;
        self.with_state(true, |state| {
            if bundle.node_health == Health::Bad {
                if let Some(node) = state.nodes.get_mut(&bundle.node_id) {
                    if node.health != Health::Bad {
                        warn!("storage node {} marked bad by {}", bundle.node_id, bundle.owner);
                    }
                    node.health = Health::Bad;
                }
            }
            state.challenges.push(bundle.clone());
            Ok(())
        })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let stale_after = self.stale_after();
        let now = Utc::now();
        self.with_state(false, |state| {
            Ok(state
                .nodes
                .values()
                .map(|n| {
                    let mut n = n.clone();
                    let fresh = n
                        .last_heartbeat
                        .map(|t| now - t <= stale_after)
                        .unwrap_or(false);
                    n.online = n.online && fresh;
                    n
                })
                .collect())
        })
    }
}
