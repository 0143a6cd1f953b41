//! Proof-of-possession challengers
//!
//! - `merkle`: precomputed one-shot byte ranges
//! - `pairing`: stateless BN254 PDP challenges

pub mod merkle;
pub mod pairing;

pub use merkle::{ChallengeRange, Interval, MerkleChallenger, MerkleMaterial};
pub use pairing::{PairingChallenger, PairingSecret, ReplicaTags};

use super::types::{ChallengeAlgorithm, Health};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Challenge settings of a data owner
#[derive(Debug, Clone)]
pub struct ChallengerSettings {
    /// Scheme for new uploads
    pub algorithm: ChallengeAlgorithm,
    pub interval: Duration,
    pub strike_threshold: u32,
    pub merkle: MerkleChallenger,
    pub pairing: PairingChallenger,
}

impl Default for ChallengerSettings {
    fn default() -> Self {
        Self {
            algorithm: ChallengeAlgorithm::Merkle,
            interval: Duration::from_secs(3600),
            strike_threshold: 3,
            merkle: MerkleChallenger::default(),
            pairing: PairingChallenger::default(),
        }
    }
}

/// Failed challenges per storage node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strikes {
    counts: BTreeMap<String, u32>,
}

impl Strikes {
    /// Record one outcome and return the node's health afterwards
    pub fn record(&mut self, node_id: &str, passed: bool, threshold: u32) -> Health {
        let count = self.counts.entry(node_id.to_string()).or_insert(0);
        if !passed {
            *count += 1;
        }
        if *count >= threshold.max(1) {
            Health::Bad
        } else {
            Health::Good
        }
    }

    pub fn count(&self, node_id: &str) -> u32 {
        self.counts.get(node_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strikes_reach_threshold() {
        let mut s = Strikes::default();
        assert_eq!(s.record("n", false, 3), Health::Good);
        assert_eq!(s.record("n", true, 3), Health::Good);
        assert_eq!(s.record("n", false, 3), Health::Good);
        assert_eq!(s.record("n", false, 3), Health::Bad);
        assert_eq!(s.count("n"), 3);
        assert_eq!(s.count("other"), 0);
    }
}
