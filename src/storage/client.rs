//! How a data owner reaches storage nodes
//!
//! `TcpStorageClient` opens one framed connection per call.
//! `LocalStorageNetwork` dispatches straight to in-process nodes and can take
//! nodes offline, which is how the lifecycle tests simulate failures.

use super::challenger::{Interval, ReplicaTags};
use super::node::{StorageNode, StorageRequest, StorageResponse};
use crate::crypto::pdp::{PdpChallenge, PdpProof};
use crate::error::{DcpError, Result};
use crate::network::Connection;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

fn unexpected(addr: &str, resp: StorageResponse) -> DcpError {
    DcpError::Encoding(format!("unexpected reply from {}: {:?}", addr, resp))
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn call(&self, addr: &str, request: StorageRequest) -> Result<StorageResponse>;

    #[allow(clippy::too_many_arguments)]
    async fn push(
        &self,
        addr: &str,
        file_id: &str,
        slice_id: &str,
        index: u64,
        owner: &str,
        data: Vec<u8>,
        tags: Option<ReplicaTags>,
        signature: Vec<u8>,
    ) -> Result<()> {
        let request = StorageRequest::Push {
            file_id: file_id.to_string(),
            slice_id: slice_id.to_string(),
            index,
            owner: owner.to_string(),
            data,
            tags,
            signature,
        };
        match self.call(addr, request).await? {
            StorageResponse::Pushed => Ok(()),
            other => Err(unexpected(addr, other)),
        }
    }

    async fn pull(&self, addr: &str, slice_id: &str) -> Result<Vec<u8>> {
        let request = StorageRequest::Pull {
            slice_id: slice_id.to_string(),
        };
        match self.call(addr, request).await? {
            StorageResponse::Data { data } => Ok(data),
            other => Err(unexpected(addr, other)),
        }
    }

    async fn exists(&self, addr: &str, slice_id: &str) -> Result<bool> {
        let request = StorageRequest::Exists {
            slice_id: slice_id.to_string(),
        };
        match self.call(addr, request).await? {
            StorageResponse::Exists { exists } => Ok(exists),
            other => Err(unexpected(addr, other)),
        }
    }

    async fn delete(&self, addr: &str, slice_id: &str, signature: Vec<u8>) -> Result<()> {
        let request = StorageRequest::Delete {
            slice_id: slice_id.to_string(),
            signature,
        };
        match self.call(addr, request).await? {
            StorageResponse::Deleted => Ok(()),
            other => Err(unexpected(addr, other)),
        }
    }

    async fn merkle_challenge(&self, addr: &str, slice_id: &str, intervals: Vec<Interval>) -> Result<Vec<Vec<u8>>> {
        let request = StorageRequest::MerkleChallenge {
            slice_id: slice_id.to_string(),
            intervals,
        };
        match self.call(addr, request).await? {
            StorageResponse::MerkleProof { parts } => Ok(parts),
            other => Err(unexpected(addr, other)),
        }
    }

    async fn pairing_challenge(&self, addr: &str, file_id: &str, challenge: PdpChallenge) -> Result<PdpProof> {
        let request = StorageRequest::PairingChallenge {
            file_id: file_id.to_string(),
            challenge,
        };
        match self.call(addr, request).await? {
            StorageResponse::PairingProof { proof } => Ok(proof),
            other => Err(unexpected(addr, other)),
        }
    }
}

/// One TCP connection per call
#[derive(Debug, Clone)]
pub struct TcpStorageClient {
    local: String,
    timeout: Duration,
}

impl TcpStorageClient {
    pub fn new(local: &str, timeout: Duration) -> Self {
        Self {
            local: local.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl StorageClient for TcpStorageClient {
    async fn call(&self, addr: &str, request: StorageRequest) -> Result<StorageResponse> {
        let mut conn = Connection::connect(addr, self.timeout).await?;
        conn.call(&self.local, request, self.timeout).await
    }
}

/// In-process storage nodes addressed by name
#[derive(Default)]
pub struct LocalStorageNetwork {
    nodes: RwLock<HashMap<String, Arc<StorageNode>>>,
    offline: RwLock<HashSet<String>>,
}

impl LocalStorageNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: Arc<StorageNode>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.address().to_string(), node);
        }
    }

    /// Make calls to `addr` fail as if the node were unreachable
    pub fn set_offline(&self, addr: &str, offline: bool) {
        if let Ok(mut set) = self.offline.write() {
            if offline {
                set.insert(addr.to_string());
            } else {
                set.remove(addr);
            }
        }
    }
}

#[async_trait]
impl StorageClient for LocalStorageNetwork {
    async fn call(&self, addr: &str, request: StorageRequest) -> Result<StorageResponse> {
        let down = self
            .offline
            .read()
            .map(|s| s.contains(addr))
            .unwrap_or(false);
        if down {
            return Err(DcpError::RpcConnect(format!("{} is offline", addr)));
        }
        let node = self
            .nodes
            .read()
            .ok()
            .and_then(|n| n.get(addr).cloned())
            .ok_or_else(|| DcpError::RpcConnect(format!("no storage node at {}", addr)))?;
        node.serve(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signer::NodeKey;
    use crate::network::Server;
    use crate::storage::blob::MemoryStore;
    use crate::storage::node::push_bytes;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_local_network_offline_switch() {
        let net = LocalStorageNetwork::new();
        net.add(Arc::new(StorageNode::new(NodeKey::generate(), "n1", Arc::new(MemoryStore::new()))));
        assert!(!net.exists("n1", "s").await.unwrap());
        net.set_offline("n1", true);
        assert_eq!(net.exists("n1", "s").await.unwrap_err().code(), 10006);
        net.set_offline("n1", false);
        assert!(!net.exists("n1", "s").await.unwrap());
        assert!(net.exists("n2", "s").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_push_and_pull() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let node = Arc::new(StorageNode::new(NodeKey::generate(), &addr, Arc::new(MemoryStore::new())));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(Server::new(addr.clone(), node).run(listener, stop_rx));

        let owner = NodeKey::generate();
        let client = TcpStorageClient::new("owner", Duration::from_secs(3));
        let data = b"ciphertext".to_vec();
        let sig = owner.sign(&push_bytes("f", "s1", 0, &data));
        client
            .push(&addr, "f", "s1", 0, &owner.id_hex(), data.clone(), None, sig)
            .await
            .unwrap();
        assert_eq!(client.pull(&addr, "s1").await.unwrap(), data);
        let err = client.pull(&addr, "missing").await.unwrap_err();
        assert_eq!(err.code(), 10002);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
