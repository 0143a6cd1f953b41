//! Stateful Merkle range challenges
//!
//! At upload the owner draws, for every replica, `ranges` challenge ranges.
//! A range is `segment_size` byte intervals, one inside each equal segment
//! of the ciphertext, so intervals never overlap. Only the Merkle root over
//! the interval hashes is kept. Each range is spent by exactly one challenge.

use crate::crypto::merkle::{self, Hash};
use crate::crypto::sha256;
use crate::error::{DcpError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Half-open byte interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRange {
    pub intervals: Vec<Interval>,
    #[serde(with = "hex::serde")]
    pub root: Hash,
    pub used: bool,
}

/// Ranges of one replica: `(file, slice, node)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleMaterial {
    pub file_id: String,
    pub slice_id: String,
    pub node_id: String,
    pub ranges: Vec<ChallengeRange>,
}

impl MerkleMaterial {
    /// Store key `"{file_id}:{slice_id}:{node_id}"`
    pub fn key(&self) -> String {
        material_key(&self.file_id, &self.slice_id, &self.node_id)
    }

    /// Spend the next unused range
    pub fn take(&mut self) -> Result<ChallengeRange> {
        let key = self.key();
        let range = self
            .ranges
            .iter_mut()
            .find(|r| !r.used)
            .ok_or_else(|| DcpError::NotFound(format!("no unused challenge range for {}", key)))?;
        range.used = true;
        Ok(range.clone())
    }

    pub fn unused(&self) -> usize {
        self.ranges.iter().filter(|r| !r.used).count()
    }
}

pub fn material_key(file_id: &str, slice_id: &str, node_id: &str) -> String {
    format!("{}:{}:{}", file_id, slice_id, node_id)
}

#[derive(Debug, Clone)]
pub struct MerkleChallenger {
    /// Ranges per replica
    pub ranges: usize,
    /// Intervals per range
    pub segment_size: usize,
    /// Upper bound on interval length
    pub shrink_size: u64,
}

impl Default for MerkleChallenger {
    fn default() -> Self {
        Self {
            ranges: 50,
            segment_size: 8,
            shrink_size: 4096,
        }
    }
}

impl MerkleChallenger {
    pub fn validate(&self) -> Result<()> {
        if self.ranges == 0 || self.segment_size == 0 || self.shrink_size == 0 {
            return Err(DcpError::Param(
                "merkle challenger needs positive ranges, segment_size and shrink_size".into(),
            ));
        }
        Ok(())
    }

    /// Random intervals for one range over `len` bytes.
    ///
    /// Within a segment `[lo, hi)` a pair is drawn and ordered; `end` is then
    /// pulled down to `start + shrink_size`, and an empty interval is widened
    /// to one byte. The result always satisfies `start < end <= hi`.
    pub fn draw_intervals<R: Rng>(&self, len: u64, rng: &mut R) -> Vec<Interval> {
        if len == 0 {
            return Vec::new();
        }
        let segments = (self.segment_size as u64).min(len);
        let width = len / segments;
        (0..segments)
            .map(|s| {
                let lo = s * width;
                let hi = if s + 1 == segments { len } else { lo + width };
                let mut start = rng.gen_range(lo..hi);
                let mut end = rng.gen_range(lo..=hi);
                if start > end {
                    std::mem::swap(&mut start, &mut end);
                }
                end = end.min(start + self.shrink_size);
                if end == start {
                    end = start + 1;
                }
                Interval { start, end }
            })
            .collect()
    }

    /// Precompute the material of one replica from its ciphertext
    pub fn generate(&self, file_id: &str, slice_id: &str, node_id: &str, ciphertext: &[u8]) -> Result<MerkleMaterial> {
        self.validate()?;
        if ciphertext.is_empty() {
            return Err(DcpError::Param(format!("slice {} has no bytes to challenge", slice_id)));
        }
        let mut rng = rand::thread_rng();
        let ranges = (0..self.ranges)
            .map(|_| {
                let intervals = self.draw_intervals(ciphertext.len() as u64, &mut rng);
                let root = root_of_intervals(ciphertext, &intervals)?;
                Ok(ChallengeRange {
                    intervals,
                    root,
                    used: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MerkleMaterial {
            file_id: file_id.to_string(),
            slice_id: slice_id.to_string(),
            node_id: node_id.to_string(),
            ranges,
        })
    }
}

/// Storage-node side: the bytes of each interval
pub fn extract(data: &[u8], intervals: &[Interval]) -> Result<Vec<Vec<u8>>> {
    intervals
        .iter()
        .map(|iv| {
            let (start, end) = (iv.start as usize, iv.end as usize);
            if start >= end || end > data.len() {
                return Err(DcpError::Param(format!(
                    "interval [{}, {}) outside {} bytes",
                    iv.start,
                    iv.end,
                    data.len()
                )));
            }
            Ok(data[start..end].to_vec())
        })
        .collect()
}

fn root_of_intervals(data: &[u8], intervals: &[Interval]) -> Result<Hash> {
    let parts = extract(data, intervals)?;
    Ok(root_of_parts(&parts))
}

/// Root over the hashes of the returned interval bytes
pub fn root_of_parts(parts: &[Vec<u8>]) -> Hash {
    let leaves: Vec<Hash> = parts.iter().map(|p| sha256(p)).collect();
    merkle::root_of_leaves(&leaves)
}

/// Owner side: compare a node's answer with the stored root
pub fn verify(range: &ChallengeRange, parts: &[Vec<u8>]) -> bool {
    parts.len() == range.intervals.len()
        && parts
            .iter()
            .zip(&range.intervals)
            .all(|(p, iv)| p.len() as u64 == iv.end - iv.start)
        && root_of_parts(parts) == range.root
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn challenger() -> MerkleChallenger {
        MerkleChallenger {
            ranges: 3,
            segment_size: 4,
            shrink_size: 16,
        }
    }

    #[test]
    fn test_intervals_are_ordered_bounded_and_disjoint() {
        let mut rng = StdRng::seed_from_u64(9);
        let c = challenger();
        for len in [1u64, 3, 100, 1000] {
            let ivs = c.draw_intervals(len, &mut rng);
            assert_eq!(ivs.len() as u64, len.min(4));
            for w in ivs.windows(2) {
                assert!(w[0].end <= w[1].start);
            }
            for iv in &ivs {
                assert!(iv.start < iv.end && iv.end <= len);
                assert!(iv.end - iv.start <= 16);
            }
        }
    }

    #[test]
    fn test_take_never_repeats_and_exhausts() {
        let data: Vec<u8> = (0..500u32).map(|i| (i * 7) as u8).collect();
        let mut m = challenger().generate("f", "s", "n", &data).unwrap();
        assert_eq!(m.key(), "f:s:n");
        let first = m.take().unwrap();
        let second = m.take().unwrap();
        assert_eq!(first, m.ranges[0]);
        assert_eq!(second, m.ranges[1]);
        assert!(first.used && second.used);
        m.take().unwrap();
        assert_eq!(m.unused(), 0);
        assert_eq!(m.take().unwrap_err().code(), 10002);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let data: Vec<u8> = (0..500u32).map(|i| (i * 7) as u8).collect();
        let mut m = challenger().generate("f", "s", "n", &data).unwrap();
        let range = m.take().unwrap();
        let parts = extract(&data, &range.intervals).unwrap();
        assert!(verify(&range, &parts));

        let mut tampered = data.clone();
        let iv = range.intervals[0];
        tampered[iv.start as usize] ^= 0xff;
        assert!(!verify(&range, &extract(&tampered, &range.intervals).unwrap()));
        assert!(!verify(&range, &parts[1..]));
    }
}
