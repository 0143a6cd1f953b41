//! Replica placement
//!
//! Each slice goes to `replicas` distinct usable nodes picked at random
//! without replacement. Replicas are encrypted per node and pushed in
//! parallel. A slice is placed once `quorum` pushes succeed; below quorum
//! the written replicas are removed and the slice is retried on a fresh set
//! that excludes the failed nodes.

use super::challenger::{PairingChallenger, PairingSecret};
use super::client::StorageClient;
use super::encryptor::Encryptor;
use super::node::{delete_bytes, push_bytes};
use super::types::{EncryptedSlice, NodeRecord, PlainSlice};
use crate::crypto::signer::NodeKey;
use crate::error::{DcpError, Result};
use futures::future::join_all;
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Copier {
    pub replicas: usize,
    pub quorum: usize,
    /// Extra attempts after the first placement fails
    pub max_retries: u32,
}

impl Default for Copier {
    fn default() -> Self {
        Self {
            replicas: 3,
            quorum: 2,
            max_retries: 3,
        }
    }
}

/// A replica written to a node
#[derive(Debug, Clone)]
pub struct Placement {
    pub node: NodeRecord,
    pub slice: EncryptedSlice,
}

/// What the copier needs from the owner to write a slice
pub struct SliceUpload<'a> {
    pub file_id: &'a str,
    pub owner: &'a NodeKey,
    pub encryptor: &'a Encryptor,
    /// Set for files audited with pairing challenges
    pub pairing: Option<(&'a PairingChallenger, &'a PairingSecret)>,
}

/// Up to `count` usable nodes not in `excluded`, in random order
pub fn pick_nodes(nodes: &[NodeRecord], count: usize, excluded: &HashSet<String>) -> Vec<NodeRecord> {
    let candidates: Vec<&NodeRecord> = nodes
        .iter()
        .filter(|n| n.is_usable() && !excluded.contains(&n.node_id))
        .collect();
    let mut rng = rand::thread_rng();
    candidates
        .choose_multiple(&mut rng, count)
        .map(|n| (*n).clone())
        .collect()
}

impl Copier {
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 || self.quorum == 0 || self.quorum > self.replicas {
            return Err(DcpError::Param(format!(
                "copier needs 0 < quorum <= replicas, got quorum {} replicas {}",
                self.quorum, self.replicas
            )));
        }
        Ok(())
    }

    /// Write `slice` to `replicas` nodes, avoiding the nodes in `exclude`
    pub async fn copy_slice(
        &self,
        client: &dyn StorageClient,
        upload: &SliceUpload<'_>,
        slice: &PlainSlice,
        nodes: &[NodeRecord],
        exclude: &[String],
    ) -> Result<Vec<Placement>> {
        self.place(client, upload, slice, nodes, exclude, self.replicas, self.quorum)
            .await
    }

    /// Write one extra replica of `slice` to a node outside `exclude`
    pub async fn copy_one(
        &self,
        client: &dyn StorageClient,
        upload: &SliceUpload<'_>,
        slice: &PlainSlice,
        nodes: &[NodeRecord],
        exclude: &[String],
    ) -> Result<Placement> {
        self.place(client, upload, slice, nodes, exclude, 1, 1)
            .await?
            .pop()
            .ok_or_else(|| DcpError::Internal(format!("slice {} placed without a replica", slice.id)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn place(
        &self,
        client: &dyn StorageClient,
        upload: &SliceUpload<'_>,
        slice: &PlainSlice,
        nodes: &[NodeRecord],
        exclude: &[String],
        count: usize,
        quorum: usize,
    ) -> Result<Vec<Placement>> {
        let mut excluded: HashSet<String> = exclude.iter().cloned().collect();
        for attempt in 0..=self.max_retries {
            let chosen = pick_nodes(nodes, count, &excluded);
            if chosen.len() < quorum {
                return Err(DcpError::RpcFindNoPeer(format!(
                    "slice {} needs {} storage nodes, {} usable",
                    slice.id,
                    quorum,
                    chosen.len()
                )));
            }

            let mut prepared = Vec::with_capacity(chosen.len());
            for node in chosen {
                let encrypted = upload.encryptor.encrypt(upload.file_id, slice, &node.node_id)?;
                let tags = match upload.pairing {
                    Some((challenger, secret)) => {
                        Some(challenger.tag_replica(secret, slice.index, &encrypted.ciphertext)?)
                    }
                    None => None,
                };
                prepared.push((node, encrypted, tags));
            }

            let owner = upload.owner.id_hex();
            let pushes = prepared.iter().map(|(node, encrypted, tags)| {
                let signature = upload.owner.sign(&push_bytes(
                    upload.file_id,
                    &slice.id,
                    slice.index,
                    &encrypted.ciphertext,
                ));
                client.push(
                    &node.address,
                    upload.file_id,
                    &slice.id,
                    slice.index,
                    &owner,
                    encrypted.ciphertext.clone(),
                    tags.clone(),
                    signature,
                )
            });
            let outcomes = join_all(pushes).await;

            let mut placed = Vec::new();
            for ((node, encrypted, _), outcome) in prepared.into_iter().zip(outcomes) {
                match outcome {
                    Ok(()) => placed.push(Placement { node, slice: encrypted }),
                    Err(e) => {
                        warn!("[{}] push of slice {} to {} failed: {}", upload.file_id, slice.id, node.address, e);
                        excluded.insert(node.node_id);
                    }
                }
            }
            if placed.len() >= quorum {
                debug!(
                    "[{}] slice {} placed on {} nodes",
                    upload.file_id,
                    slice.id,
                    placed.len()
                );
                return Ok(placed);
            }

            warn!(
                "[{}] slice {} reached {} of {} replicas on attempt {}, retrying",
                upload.file_id,
                slice.id,
                placed.len(),
                quorum,
                attempt + 1
            );
            remove_replicas(client, upload.owner, &placed).await;
        }
        Err(DcpError::RpcConnect(format!(
            "slice {} could not reach {} replicas after {} attempts",
            slice.id,
            quorum,
            self.max_retries + 1
        )))
    }
}

/// Best-effort removal of written replicas
pub async fn remove_replicas(client: &dyn StorageClient, owner: &NodeKey, placed: &[Placement]) {
    let deletes = placed.iter().map(|p| {
        let signature = owner.sign(&delete_bytes(&p.slice.slice_id));
        client.delete(&p.node.address, &p.slice.slice_id, signature)
    });
    for (p, outcome) in placed.iter().zip(join_all(deletes).await) {
        if let Err(e) = outcome {
            warn!("could not remove slice {} from {}: {}", p.slice.slice_id, p.node.address, e);
        }
    }
}
