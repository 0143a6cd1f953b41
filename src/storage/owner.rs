//! Data owner: upload, download and audit of files on storage nodes

use super::chain::Ledger;
use super::challenger::merkle::ChallengeRange;
use super::challenger::ChallengerSettings;
use super::client::StorageClient;
use super::copier::{remove_replicas, Copier, Placement, SliceUpload};
use super::encryptor::Encryptor;
use super::material::{MaterialStore, OwnedFile};
use super::node::delete_bytes;
use super::slicer::Slicer;
use super::types::{ChallengeAlgorithm, FileRecord, Health, NodeRecord, PlainSlice, ProofBundle, Replica, SliceMeta};
use crate::crypto::merkle::{root_of_leaves, Hash};
use crate::crypto::pdp;
use crate::crypto::sha256;
use crate::crypto::signer::NodeKey;
use crate::error::{DcpError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outcome of challenging one node for one file
#[derive(Debug)]
enum Audit {
    Passed(String),
    Failed(String),
    /// Nothing could be checked
    Skipped(String),
}

pub struct DataOwner {
    key: NodeKey,
    ledger: Arc<dyn Ledger>,
    client: Arc<dyn StorageClient>,
    slicer: Slicer,
    encryptor: Encryptor,
    copier: Copier,
    challenger: ChallengerSettings,
    materials: Mutex<MaterialStore>,
}

fn decode_hash(hex_hash: &str) -> Result<Hash> {
    let bytes = hex::decode(hex_hash)?;
    bytes
        .try_into()
        .map_err(|_| DcpError::Encoding(format!("hash {} is not 32 bytes", hex_hash)))
}

impl DataOwner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: NodeKey,
        ledger: Arc<dyn Ledger>,
        client: Arc<dyn StorageClient>,
        slicer: Slicer,
        encryptor: Encryptor,
        copier: Copier,
        challenger: ChallengerSettings,
        materials: MaterialStore,
    ) -> Result<Self> {
        copier.validate()?;
        challenger.merkle.validate()?;
        challenger.pairing.validate()?;
        Ok(Self {
            key,
            ledger,
            client,
            slicer,
            encryptor,
            copier,
            challenger,
            materials: Mutex::new(materials),
        })
    }

    pub fn owner_id(&self) -> String {
        self.key.id_hex()
    }

    fn materials(&self) -> Result<MutexGuard<'_, MaterialStore>> {
        self.materials
            .lock()
            .map_err(|_| DcpError::Internal("material store poisoned".into()))
    }

    /// Files uploaded by this owner
    pub fn files(&self) -> Result<Vec<OwnedFile>> {
        Ok(self.materials()?.files())
    }

    async fn publish(&self, record: &FileRecord) -> Result<()> {
        let signature = self.key.sign(&record.signing_bytes()?);
        self.ledger.publish_file(record, &signature).await
    }

    /// Slice, encrypt and replicate `reader`, then publish version 1
    pub async fn upload<R: Read>(&self, name: &str, ns: &str, reader: R, expire_days: u32) -> Result<FileRecord> {
        let file_id = Uuid::new_v4().to_string();
        let slices = self.slicer.slice(reader)?;
        let nodes = self.ledger.list_nodes().await?;
        let algorithm = self.challenger.algorithm;
        let secret = match algorithm {
            ChallengeAlgorithm::Pairing => Some(self.challenger.pairing.new_secret(&file_id)),
            ChallengeAlgorithm::Merkle => None,
        };
        let upload = SliceUpload {
            file_id: &file_id,
            owner: &self.key,
            encryptor: &self.encryptor,
            pairing: secret.as_ref().map(|s| (&self.challenger.pairing, s)),
        };

        let mut placed: Vec<Placement> = Vec::new();
        let mut metas = Vec::with_capacity(slices.len());
        let mut merkle = Vec::new();
        for slice in &slices {
            let replicas = match self
                .copier
                .copy_slice(self.client.as_ref(), &upload, slice, &nodes, &[])
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("[{}] upload aborted at slice {}: {}", file_id, slice.index, e);
                    remove_replicas(self.client.as_ref(), &self.key, &placed).await;
                    return Err(e);
                }
            };
            if algorithm == ChallengeAlgorithm::Merkle {
                for p in &replicas {
                    merkle.push(self.challenger.merkle.generate(
                        &file_id,
                        &slice.id,
                        &p.node.node_id,
                        &p.slice.ciphertext,
                    )?);
                }
            }
            metas.push(SliceMeta {
                id: slice.id.clone(),
                index: slice.index,
                hash: hex::encode(slice.hash),
                length: slice.data.len() as u64,
                replicas: replicas.iter().map(replica_of).collect(),
            });
            placed.extend(replicas);
        }

        let hashes: Vec<Hash> = slices.iter().map(|s| s.hash).collect();
        let now = Utc::now();
        let record = FileRecord {
            file_id: file_id.clone(),
            version: 1,
            owner_pubkey: self.key.id_hex(),
            name: name.to_string(),
            ns: ns.to_string(),
            length: slices.iter().map(|s| s.data.len() as u64).sum(),
            merkle_root: hex::encode(root_of_leaves(&hashes)),
            slices: metas,
            expire_at: now + ChronoDuration::days(i64::from(expire_days)),
            pdp_pubkey: secret.as_ref().map(|s| pdp::to_hex(&s.keys.public)).transpose()?,
            challenge_algorithm: algorithm,
            created_at: now,
        };
        if let Err(e) = self.publish(&record).await {
            remove_replicas(self.client.as_ref(), &self.key, &placed).await;
            return Err(e);
        }

        let mut materials = self.materials()?;
        materials.put_merkle(merkle)?;
        if let Some(secret) = secret {
            materials.put_pairing(secret)?;
        }
        materials.add_file(OwnedFile {
            file_id: file_id.clone(),
            name: name.to_string(),
            ns: ns.to_string(),
            rounds: 0,
        })?;
        info!(
            "[{}] uploaded {} ({} bytes, {} slices, {:?} challenges)",
            file_id,
            name,
            record.length,
            record.slices.len(),
            algorithm
        );
        Ok(record)
    }

    async fn node_map(&self) -> Result<HashMap<String, NodeRecord>> {
        Ok(self
            .ledger
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect())
    }

    /// Plaintext of one slice from the first replica that checks out
    async fn fetch_slice(
        &self,
        file_id: &str,
        slice: &SliceMeta,
        nodes: &HashMap<String, NodeRecord>,
        skip: Option<&str>,
    ) -> Result<Vec<u8>> {
        let expected = decode_hash(&slice.hash)?;
        for replica in &slice.replicas {
            if skip == Some(replica.node_id.as_str()) {
                continue;
            }
            let node = match nodes.get(&replica.node_id) {
                Some(n) if n.is_usable() => n,
                _ => continue,
            };
            let ciphertext = match self.client.pull(&node.address, &slice.id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("[{}] pull of slice {} from {} failed: {}", file_id, slice.id, node.address, e);
                    continue;
                }
            };
            if hex::encode(sha256(&ciphertext)) != replica.cipher_hash {
                warn!("[{}] slice {} from {} has a bad cipher hash", file_id, slice.id, node.address);
                continue;
            }
            let plain = match self
                .encryptor
                .decrypt(file_id, &slice.id, &replica.node_id, &ciphertext)
            {
                Ok(p) => p,
                Err(e) => {
                    warn!("[{}] slice {} from {} does not decrypt: {}", file_id, slice.id, node.address, e);
                    continue;
                }
            };
            if sha256(&plain) == expected {
                return Ok(plain);
            }
            warn!("[{}] slice {} from {} has a bad plaintext hash", file_id, slice.id, node.address);
        }
        Err(DcpError::NotFound(format!(
            "no healthy replica of slice {} of file {}",
            slice.id, file_id
        )))
    }

    /// Fetch, verify and concatenate every slice of a file
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let record = self.ledger.get_file(file_id).await?;
        let nodes = self.node_map().await?;
        let mut slices: Vec<&SliceMeta> = record.slices.iter().collect();
        slices.sort_by_key(|s| s.index);

        let mut out = Vec::with_capacity(record.length as usize);
        let mut hashes = Vec::with_capacity(slices.len());
        for slice in slices {
            let plain = self.fetch_slice(file_id, slice, &nodes, None).await?;
            hashes.push(sha256(&plain));
            out.extend_from_slice(&plain);
        }
        if hex::encode(root_of_leaves(&hashes)) != record.merkle_root {
            return Err(DcpError::Encoding(format!("merkle root mismatch for file {}", file_id)));
        }
        info!("[{}] downloaded {} bytes", file_id, out.len());
        Ok(out)
    }

    /// Remove every replica and the local materials of a file
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let record = self.ledger.get_file(file_id).await?;
        if record.owner_pubkey != self.key.id_hex() {
            return Err(DcpError::Param(format!("file {} belongs to another owner", file_id)));
        }
        let nodes = self.node_map().await?;
        for slice in &record.slices {
            let signature = self.key.sign(&delete_bytes(&slice.id));
            for replica in &slice.replicas {
                let addr = match nodes.get(&replica.node_id) {
                    Some(n) => n.address.clone(),
                    None => continue,
                };
                if let Err(e) = self.client.delete(&addr, &slice.id, signature.clone()).await {
                    warn!("[{}] delete of slice {} on {} failed: {}", file_id, slice.id, addr, e);
                }
            }
        }
        self.materials()?.remove_file(file_id)?;
        info!("[{}] deleted", file_id);
        Ok(())
    }

    /// Challenge `node` once for every slice it holds. A slice whose ranges
    /// are spent gets fresh material first; a slice that cannot be refreshed
    /// is left out of the round.
    async fn merkle_round(
        &self,
        record: &FileRecord,
        node: &NodeRecord,
        nodes: &HashMap<String, NodeRecord>,
    ) -> Result<Audit> {
        let mut checked = 0;
        let mut unchecked = 0;
        for slice in record.slices.iter().filter(|s| s.holds(&node.node_id)) {
            let taken = self
                .materials()?
                .take_range(&record.file_id, &slice.id, &node.node_id);
            let range = match taken {
                Ok(r) => r,
                Err(DcpError::NotFound(_)) => match self.refresh_merkle(record, slice, node, nodes).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(
                            "[{}] slice {} on {} cannot be challenged: {}",
                            record.file_id, slice.id, node.node_id, e
                        );
                        unchecked += 1;
                        continue;
                    }
                },
                Err(e) => return Err(e),
            };
            let parts = match self
                .client
                .merkle_challenge(&node.address, &slice.id, range.intervals.clone())
                .await
            {
                Ok(p) => p,
                Err(e) => return Ok(Audit::Failed(format!("slice {}: {}", slice.id, e))),
            };
            if !super::challenger::merkle::verify(&range, &parts) {
                return Ok(Audit::Failed(format!("slice {}: merkle root mismatch", slice.id)));
            }
            checked += 1;
        }
        if checked == 0 {
            return Ok(Audit::Skipped(format!("{} slices without challenge material", unchecked)));
        }
        Ok(Audit::Passed(format!("{} slices verified, {} skipped", checked, unchecked)))
    }

    /// Rebuild the replica `node` should hold from another healthy replica,
    /// draw new ranges over it and spend the first one
    async fn refresh_merkle(
        &self,
        record: &FileRecord,
        slice: &SliceMeta,
        node: &NodeRecord,
        nodes: &HashMap<String, NodeRecord>,
    ) -> Result<ChallengeRange> {
        let replica = slice
            .replicas
            .iter()
            .find(|r| r.node_id == node.node_id)
            .ok_or_else(|| DcpError::NotFound(format!("node {} holds no replica of {}", node.node_id, slice.id)))?;
        let data = self
            .fetch_slice(&record.file_id, slice, nodes, Some(&node.node_id))
            .await?;
        let plain = PlainSlice {
            id: slice.id.clone(),
            index: slice.index,
            hash: decode_hash(&slice.hash)?,
            data,
        };
        let encrypted = self.encryptor.encrypt(&record.file_id, &plain, &node.node_id)?;
        if hex::encode(encrypted.cipher_hash) != replica.cipher_hash {
            return Err(DcpError::Encoding(format!(
                "rebuilt replica of {} does not match its recorded hash",
                slice.id
            )));
        }
        let material =
            self.challenger
                .merkle
                .generate(&record.file_id, &slice.id, &node.node_id, &encrypted.ciphertext)?;
        let mut materials = self.materials()?;
        materials.put_merkle(vec![material])?;
        let range = materials.take_range(&record.file_id, &slice.id, &node.node_id)?;
        info!(
            "[{}] refreshed challenge material of slice {} on {}",
            record.file_id, slice.id, node.node_id
        );
        Ok(range)
    }

    async fn pairing_round(&self, record: &FileRecord, node: &NodeRecord, round: u64) -> Result<Audit> {
        let secret = self.materials()?.pairing(&record.file_id)?.clone();
        let held: Vec<u64> = record
            .slices
            .iter()
            .filter(|s| s.holds(&node.node_id))
            .map(|s| s.index)
            .collect();
        let challenge = self.challenger.pairing.challenge(&secret, round, &held)?;
        let proof = match self
            .client
            .pairing_challenge(&node.address, &record.file_id, challenge.clone())
            .await
        {
            Ok(p) => p,
            Err(e) => return Ok(Audit::Failed(e.to_string())),
        };
        if self.challenger.pairing.verify(&secret, &challenge, &proof)? {
            Ok(Audit::Passed(format!("{} slices sampled", challenge.indices.len())))
        } else {
            Ok(Audit::Failed("pairing proof rejected".to_string()))
        }
    }

    /// Challenge every node holding a replica of the file once. Outcomes are
    /// published to the ledger; nodes that reach the strike threshold are
    /// migrated away from. A node with nothing left to check gets no outcome.
    pub async fn challenge_file(&self, file_id: &str) -> Result<Vec<ProofBundle>> {
        let record = self.ledger.get_file(file_id).await?;
        let round = self.materials()?.next_round(file_id)?;
        let nodes = self.node_map().await?;
        let mut bundles = Vec::new();
        let mut bad = Vec::new();

        for node_id in record.nodes() {
            let audit = match nodes.get(&node_id) {
                None => Audit::Failed("node not registered".to_string()),
                Some(node) => match record.challenge_algorithm {
                    ChallengeAlgorithm::Merkle => self.merkle_round(&record, node, &nodes).await?,
                    ChallengeAlgorithm::Pairing => self.pairing_round(&record, node, round).await?,
                },
            };
            let (passed, detail) = match audit {
                Audit::Passed(detail) => (true, detail),
                Audit::Failed(detail) => (false, detail),
                Audit::Skipped(detail) => {
                    warn!("[{}] node {} not audited in round {}: {}", file_id, node_id, round, detail);
                    continue;
                }
            };
            let threshold = self.challenger.strike_threshold;
            let health = self
                .materials()?
                .with_strikes(|s| s.record(&node_id, passed, threshold))?;
            if !passed {
                warn!("[{}] node {} failed round {}: {}", file_id, node_id, round, detail);
            }
            let bundle = ProofBundle {
                file_id: file_id.to_string(),
                node_id: node_id.clone(),
                owner: self.key.id_hex(),
                algorithm: record.challenge_algorithm,
                round,
                passed,
                node_health: health,
                detail,
                timestamp: Utc::now(),
            };
            let signature = self.key.sign(&bundle.signing_bytes()?);
            self.ledger.challenge_response(&bundle, &signature).await?;
            if health == Health::Bad {
                bad.push(node_id);
            }
            bundles.push(bundle);
        }

        for node_id in bad {
            self.migrate(file_id, &node_id).await?;
        }
        Ok(bundles)
    }

    /// Move every replica held by `bad_node` to a fresh node and publish
    /// the next version of the file record
    pub async fn migrate(&self, file_id: &str, bad_node: &str) -> Result<FileRecord> {
        let mut record = self.ledger.get_file(file_id).await?;
        let nodes = self.node_map().await?;
        let node_list: Vec<NodeRecord> = nodes.values().cloned().collect();
        let secret = match record.challenge_algorithm {
            ChallengeAlgorithm::Pairing => Some(self.materials()?.pairing(file_id)?.clone()),
            ChallengeAlgorithm::Merkle => None,
        };
        let upload = SliceUpload {
            file_id,
            owner: &self.key,
            encryptor: &self.encryptor,
            pairing: secret.as_ref().map(|s| (&self.challenger.pairing, s)),
        };

        let mut moved = 0;
        for i in 0..record.slices.len() {
            if !record.slices[i].holds(bad_node) {
                continue;
            }
            let meta = record.slices[i].clone();
            let data = self.fetch_slice(file_id, &meta, &nodes, Some(bad_node)).await?;
            let plain = PlainSlice {
                id: meta.id.clone(),
                index: meta.index,
                hash: decode_hash(&meta.hash)?,
                data,
            };
            let holders: Vec<String> = meta.replicas.iter().map(|r| r.node_id.clone()).collect();
            let placement = self
                .copier
                .copy_one(self.client.as_ref(), &upload, &plain, &node_list, &holders)
                .await?;

            {
                let mut materials = self.materials()?;
                materials.remove_merkle(file_id, &meta.id, bad_node)?;
                if record.challenge_algorithm == ChallengeAlgorithm::Merkle {
                    materials.put_merkle(vec![self.challenger.merkle.generate(
                        file_id,
                        &meta.id,
                        &placement.node.node_id,
                        &placement.slice.ciphertext,
                    )?])?;
                }
            }
            if let Some(node) = nodes.get(bad_node) {
                let signature = self.key.sign(&delete_bytes(&meta.id));
                if let Err(e) = self.client.delete(&node.address, &meta.id, signature).await {
                    warn!("[{}] could not remove slice {} from bad node: {}", file_id, meta.id, e);
                }
            }

            let slice = &mut record.slices[i];
            slice.replicas.retain(|r| r.node_id != bad_node);
            slice.replicas.push(replica_of(&placement));
            moved += 1;
        }

        record.version += 1;
        self.publish(&record).await?;
        info!(
            "[{}] migrated {} slices off node {}, now version {}",
            file_id, moved, bad_node, record.version
        );
        Ok(record)
    }

    /// Challenge every owned file each `interval` until `shutdown` flips
    pub fn spawn_challenge_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let files = match self.files() {
                            Ok(f) => f,
                            Err(e) => {
                                warn!("challenge loop cannot read materials: {}", e);
                                continue;
                            }
                        };
                        for file in files {
                            match self.challenge_file(&file.file_id).await {
                                Ok(bundles) => {
                                    let failed = bundles.iter().filter(|b| !b.passed).count();
                                    info!("[{}] challenge round: {} nodes, {} failed", file.file_id, bundles.len(), failed);
                                }
                                Err(e) => warn!("[{}] challenge round failed: {}", file.file_id, e),
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("challenge loop stopped");
        })
    }
}

fn replica_of(p: &Placement) -> Replica {
    Replica {
        node_id: p.node.node_id.clone(),
        cipher_hash: hex::encode(p.slice.cipher_hash),
        cipher_length: p.slice.length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::{BlobStore, MemoryStore};
    use crate::storage::chain::MemoryChain;
    use crate::storage::challenger::{MerkleChallenger, PairingChallenger};
    use crate::storage::client::LocalStorageNetwork;
    use crate::storage::node::StorageNode;

    struct Fixture {
        owner: DataOwner,
        net: Arc<LocalStorageNetwork>,
        stores: Vec<Arc<MemoryStore>>,
        chain: Arc<MemoryChain>,
    }

    async fn fixture(nodes: usize, algorithm: ChallengeAlgorithm) -> Fixture {
        let chain = Arc::new(MemoryChain::new(Duration::from_secs(60)));
        let net = Arc::new(LocalStorageNetwork::new());
        let mut stores = Vec::new();
        for i in 0..nodes {
            let store = Arc::new(MemoryStore::new());
            let node = Arc::new(StorageNode::new(NodeKey::generate(), &format!("node-{}", i), store.clone()));
            node.register(chain.as_ref()).await.unwrap();
            net.add(node);
            stores.push(store);
        }
        let settings = ChallengerSettings {
            algorithm,
            interval: Duration::from_secs(3600),
            strike_threshold: 2,
            merkle: MerkleChallenger {
                ranges: 4,
                segment_size: 3,
                shrink_size: 16,
            },
            pairing: PairingChallenger {
                sample_count: 2,
                tag_rounds: 2,
            },
        };
        let owner = DataOwner::new(
            NodeKey::generate(),
            chain.clone(),
            net.clone(),
            Slicer::new(64).unwrap(),
            Encryptor::new(b"owner password").unwrap(),
            Copier {
                replicas: 2,
                quorum: 2,
                max_retries: 2,
            },
            settings,
            MaterialStore::in_memory(),
        )
        .unwrap();
        Fixture {
            owner,
            net,
            stores,
            chain,
        }
    }

    fn payload() -> Vec<u8> {
        (0..200u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let fx = fixture(3, ChallengeAlgorithm::Merkle).await;
        let data = payload();
        let record = fx.owner.upload("a.bin", "ns", &data[..], 7).await.unwrap();
        assert_eq!(record.slices.len(), 4);
        assert_eq!(record.length, 200);
        assert!(record.slices.iter().all(|s| s.replicas.len() == 2));
        assert_eq!(fx.owner.download(&record.file_id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_survives_one_corrupt_replica() {
        let fx = fixture(2, ChallengeAlgorithm::Merkle).await;
        let data = payload();
        let record = fx.owner.upload("a.bin", "ns", &data[..], 7).await.unwrap();
        for slice in &record.slices {
            fx.stores[0].corrupt(&slice.id, |d| d[0] ^= 0xff);
        }
        assert_eq!(fx.owner.download(&record.file_id).await.unwrap(), data);

        fx.stores[1].corrupt(&record.slices[2].id, |d| d[0] ^= 0xff);
        let err = fx.owner.download(&record.file_id).await.unwrap_err();
        assert_eq!(err.code(), 10002);
    }

    #[tokio::test]
    async fn test_merkle_challenge_strikes_and_migrates() {
        let fx = fixture(3, ChallengeAlgorithm::Merkle).await;
        let record = fx.owner.upload("a.bin", "ns", &payload()[..], 7).await.unwrap();
        let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
        assert!(bundles.iter().all(|b| b.passed));

        let victim = record.nodes()[0].clone();
        let nodes = fx.chain.list_nodes().await.unwrap();
        let addr = nodes.iter().find(|n| n.node_id == victim).unwrap().address.clone();
        fx.net.set_offline(&addr, true);

        let first = fx.owner.challenge_file(&record.file_id).await.unwrap();
        let failed = first.iter().find(|b| b.node_id == victim).unwrap();
        assert!(!failed.passed);
        assert_eq!(failed.node_health, Health::Good);

        let second = fx.owner.challenge_file(&record.file_id).await.unwrap();
        assert_eq!(second.iter().find(|b| b.node_id == victim).unwrap().node_health, Health::Bad);

        let migrated = fx.chain.get_file(&record.file_id).await.unwrap();
        assert_eq!(migrated.version, 2);
        assert!(!migrated.nodes().contains(&victim));
        assert!(migrated.slices.iter().all(|s| s.replicas.len() == 2));
        let listed = fx.chain.list_nodes().await.unwrap();
        assert_eq!(listed.iter().find(|n| n.node_id == victim).unwrap().health, Health::Bad);
        assert_eq!(fx.owner.download(&record.file_id).await.unwrap(), payload());
        assert_eq!(fx.chain.challenges().len(), bundles.len() + first.len() + second.len());
    }

    async fn node_id_at(fx: &Fixture, addr: &str) -> String {
        let nodes = fx.chain.list_nodes().await.unwrap();
        nodes.iter().find(|n| n.address == addr).unwrap().node_id.clone()
    }

    #[tokio::test]
    async fn test_spent_ranges_are_refreshed_and_still_catch_corruption() {
        let fx = fixture(2, ChallengeAlgorithm::Merkle).await;
        let record = fx.owner.upload("a.bin", "ns", &payload()[..], 7).await.unwrap();
        for _ in 0..4 {
            let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
            assert_eq!(bundles.len(), 2);
            assert!(bundles.iter().all(|b| b.passed));
        }

        let refreshed = fx.owner.challenge_file(&record.file_id).await.unwrap();
        assert_eq!(refreshed.len(), 2);
        assert!(refreshed.iter().all(|b| b.passed));

        for slice in &record.slices {
            fx.stores[0].corrupt(&slice.id, |d| d.iter_mut().for_each(|b| *b ^= 0xff));
        }
        let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
        let corrupted = node_id_at(&fx, "node-0").await;
        assert!(!bundles.iter().find(|b| b.node_id == corrupted).unwrap().passed);
        assert!(bundles.iter().find(|b| b.node_id != corrupted).unwrap().passed);
    }

    #[tokio::test]
    async fn test_node_without_material_gets_no_outcome() {
        let fx = fixture(2, ChallengeAlgorithm::Merkle).await;
        let record = fx.owner.upload("a.bin", "ns", &payload()[..], 7).await.unwrap();
        for _ in 0..4 {
            fx.owner.challenge_file(&record.file_id).await.unwrap();
        }

        // node-0 can only be refreshed from node-1
        fx.net.set_offline("node-1", true);
        let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].node_id, node_id_at(&fx, "node-1").await);
        assert!(!bundles[0].passed);
        assert_eq!(fx.chain.challenges().len(), 4 * 2 + 1);
    }

    #[tokio::test]
    async fn test_pairing_challenge_passes_and_detects_corruption() {
        let fx = fixture(2, ChallengeAlgorithm::Pairing).await;
        let record = fx.owner.upload("a.bin", "ns", &payload()[..], 7).await.unwrap();
        assert!(record.pdp_pubkey.is_some());
        let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
        assert_eq!(bundles.len(), 2);
        assert!(bundles.iter().all(|b| b.passed));

        for slice in &record.slices {
            fx.stores[0].corrupt(&slice.id, |d| d[0] ^= 0x01);
        }
        let bundles = fx.owner.challenge_file(&record.file_id).await.unwrap();
        let nodes = fx.chain.list_nodes().await.unwrap();
        let corrupted = nodes.iter().find(|n| n.address == "node-0").unwrap();
        assert!(!bundles.iter().find(|b| b.node_id == corrupted.node_id).unwrap().passed);
    }

    #[tokio::test]
    async fn test_delete_removes_replicas() {
        let fx = fixture(2, ChallengeAlgorithm::Merkle).await;
        let record = fx.owner.upload("a.bin", "ns", &payload()[..], 7).await.unwrap();
        fx.owner.delete(&record.file_id).await.unwrap();
        for store in &fx.stores {
            for slice in &record.slices {
                assert!(!store.exists(&slice.id).unwrap());
            }
        }
        assert!(fx.owner.files().unwrap().is_empty());
    }
}
