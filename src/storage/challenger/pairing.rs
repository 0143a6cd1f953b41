//! Stateless pairing challenges
//!
//! The owner keeps one `PairingSecret` per file. Tags are computed per
//! replica for `tag_rounds` rounds and shipped with the ciphertext; a
//! challenge for any round is rebuilt from the secret alone.

use crate::crypto::pdp::{self, ark_hex, FileParams, PdpChallenge, PdpKeyPair, PdpProof};
use crate::error::{DcpError, Result};
use ark_bn254::G1Affine;
use serde::{Deserialize, Serialize};

/// Owner-side secret material of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSecret {
    pub file_id: String,
    pub keys: PdpKeyPair,
    pub params: FileParams,
}

/// Sigma tags of one replica, one per tag round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaTags(#[serde(with = "ark_hex")] pub Vec<G1Affine>);

impl ReplicaTags {
    pub fn for_round(&self, tag_round: u64) -> Result<&G1Affine> {
        self.0
            .get(tag_round as usize)
            .ok_or_else(|| DcpError::NotFound(format!("sigma tag for tag round {}", tag_round)))
    }
}

#[derive(Debug, Clone)]
pub struct PairingChallenger {
    /// Slices sampled per challenge
    pub sample_count: usize,
    /// Precomputed tag sets per replica
    pub tag_rounds: u64,
}

impl Default for PairingChallenger {
    fn default() -> Self {
        Self {
            sample_count: 5,
            tag_rounds: 4,
        }
    }
}

impl PairingChallenger {
    pub fn validate(&self) -> Result<()> {
        if self.sample_count == 0 || self.tag_rounds == 0 {
            return Err(DcpError::Param(
                "pairing challenger needs positive sample_count and tag_rounds".into(),
            ));
        }
        Ok(())
    }

    pub fn new_secret(&self, file_id: &str) -> PairingSecret {
        PairingSecret {
            file_id: file_id.to_string(),
            keys: pdp::gen_key_pair(),
            params: FileParams::generate(),
        }
    }

    /// Tags of one replica; `ciphertext` is what the node will hold
    pub fn tag_replica(&self, secret: &PairingSecret, index: u64, ciphertext: &[u8]) -> Result<ReplicaTags> {
        let tags = (0..self.tag_rounds)
            .map(|r| pdp::gen_tag(&secret.keys, &secret.params, index, r, ciphertext))
            .collect::<Result<Vec<_>>>()?;
        Ok(ReplicaTags(tags))
    }

    /// Challenge for `round` over the slice indices a node holds
    pub fn challenge(&self, secret: &PairingSecret, round: u64, held: &[u64]) -> Result<PdpChallenge> {
        pdp::gen_challenge(
            &secret.keys,
            &secret.params,
            round,
            self.tag_rounds,
            held,
            self.sample_count,
        )
    }

    pub fn verify(&self, secret: &PairingSecret, challenge: &PdpChallenge, proof: &PdpProof) -> Result<bool> {
        pdp::verify(&secret.keys.public, &secret.params, challenge, proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pdp::ProofItem;

    #[test]
    fn test_challenge_is_reproducible_from_secret() {
        let c = PairingChallenger {
            sample_count: 2,
            tag_rounds: 3,
        };
        let secret = c.new_secret("f");
        let a = c.challenge(&secret, 11, &[0, 1, 2, 3]).unwrap();
        let b = c.challenge(&secret, 11, &[0, 1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.indices.len(), 2);
        assert_eq!(a.tag_round, 11 % 3);
    }

    #[test]
    fn test_tags_prove_and_verify() {
        let c = PairingChallenger {
            sample_count: 2,
            tag_rounds: 2,
        };
        let secret = c.new_secret("f");
        let blobs = [b"first replica".to_vec(), b"second replica".to_vec()];
        let tags: Vec<ReplicaTags> = blobs
            .iter()
            .enumerate()
            .map(|(i, b)| c.tag_replica(&secret, i as u64, b).unwrap())
            .collect();
        let challenge = c.challenge(&secret, 5, &[0, 1]).unwrap();
        let items: Vec<ProofItem<'_>> = challenge
            .indices
            .iter()
            .map(|i| ProofItem {
                index: *i,
                tag: tags[*i as usize].for_round(challenge.tag_round).unwrap(),
                content: &blobs[*i as usize],
            })
            .collect();
        let proof = pdp::prove(&challenge, &items).unwrap();
        assert!(c.verify(&secret, &challenge, &proof).unwrap());
        assert!(tags[0].for_round(7).is_err());
    }
}
