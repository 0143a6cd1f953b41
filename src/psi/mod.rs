//! Private set intersection by commutative encryption
//!
//! Party A sends `H(x)^{k_A}` for its ids, B returns them raised to `k_B`
//! and symmetrically. Doubly encrypted points are equal exactly when the
//! underlying ids are, so each side learns which of *its own* rows are in
//! the intersection and nothing about the other side's remaining ids.
//!
//! The aligned row order is the ascending order of the intersecting id
//! strings, which both parties can compute without further exchange.

pub mod curve;

use crate::error::{DcpError, Result};
use p256::NonZeroScalar;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Result of a completed intersection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intersection {
    /// Row indices into the local id list, in aligned order
    pub rows: Vec<usize>,
    /// Intersecting ids, in aligned order
    pub ids: Vec<String>,
}

/// One party's PSI state
pub struct Psi {
    key: NonZeroScalar,
    own_ids: Vec<String>,
    own_enc: Vec<Vec<u8>>,
    received_enc: HashMap<String, Vec<Vec<u8>>>,
    own_final_reenc: Option<Vec<Vec<u8>>>,
    other_final_reenc: Option<Vec<Vec<u8>>>,
    result: Option<Intersection>,
}

impl std::fmt::Debug for Psi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Psi")
            .field("own_ids", &self.own_ids.len())
            .field("received", &self.received_enc.len())
            .field("done", &self.result.is_some())
            .finish()
    }
}

impl Psi {
    /// Hash and encrypt the local ids under a fresh key
    pub fn new(ids: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(DcpError::Param("duplicate id in psi input".into()));
            }
        }
        let key = curve::random_key();
        let own_enc = ids
            .par_iter()
            .map(|id| {
                let point = curve::hash_to_point(id)?;
                Ok(curve::encode_point(&(point * key.as_ref())))
            })
            .collect::<Result<Vec<_>>>()?;
        log::debug!("psi encrypted {} local ids", own_enc.len());
        Ok(Self {
            key,
            own_ids: ids,
            own_enc,
            received_enc: HashMap::new(),
            own_final_reenc: None,
            other_final_reenc: None,
            result: None,
        })
    }

    /// `E_own = {H(x)^k}` in local row order
    pub fn own_encrypted(&self) -> &[Vec<u8>] {
        &self.own_enc
    }

    pub fn own_ids(&self) -> &[String] {
        &self.own_ids
    }

    /// Raise the peer's set to the local key; the result goes back to the peer
    pub fn re_encrypt(&mut self, party: &str, peer_enc: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let key = self.key;
        let reenc = peer_enc
            .par_iter()
            .map(|p| curve::exponentiate(p, &key))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("psi re-encrypted {} ids from {}", reenc.len(), party);
        self.received_enc.insert(party.to_string(), peer_enc);
        self.other_final_reenc = Some(reenc.clone());
        Ok(reenc)
    }

    /// Store our own set as re-encrypted by the peer, in local row order
    pub fn set_own_final(&mut self, reenc: Vec<Vec<u8>>) -> Result<()> {
        if reenc.len() != self.own_ids.len() {
            return Err(DcpError::PsiIntersectParts(format!(
                "peer returned {} re-encrypted ids, expected {}",
                reenc.len(),
                self.own_ids.len()
            )));
        }
        for p in &reenc {
            if p.len() != curve::POINT_LEN {
                return Err(DcpError::Param("re-encrypted id length mismatch".into()));
            }
        }
        self.own_final_reenc = Some(reenc);
        Ok(())
    }

    /// Compute the intersection once both double encryptions are known.
    ///
    /// Returns `None` while a part is still missing; repeated calls after
    /// completion return the same intersection.
    pub fn intersect_parts(&mut self) -> Result<Option<Intersection>> {
        if let Some(done) = &self.result {
            return Ok(Some(done.clone()));
        }
        let (own_final, other_final) = match (&self.own_final_reenc, &self.other_final_reenc) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(None),
        };
        let other: HashSet<&[u8]> = other_final.iter().map(|p| p.as_slice()).collect();
        let mut hits: Vec<(usize, &String)> = own_final
            .iter()
            .enumerate()
            .filter(|(_, p)| other.contains(p.as_slice()))
            .map(|(row, _)| (row, &self.own_ids[row]))
            .collect();
        hits.sort_by(|a, b| a.1.cmp(b.1));
        let result = Intersection {
            rows: hits.iter().map(|(row, _)| *row).collect(),
            ids: hits.iter().map(|(_, id)| (*id).clone()).collect(),
        };
        log::info!(
            "psi intersection has {} of {} local rows",
            result.rows.len(),
            self.own_ids.len()
        );
        self.result = Some(result.clone());
        Ok(Some(result))
    }
}

/// Reorder the rows of a table to match an intersection
pub fn rearrange<T: Clone>(rows: &[T], intersection: &Intersection) -> Result<Vec<T>> {
    intersection
        .rows
        .iter()
        .map(|r| {
            rows.get(*r).cloned().ok_or_else(|| {
                DcpError::PsiRearrangeFile(format!("row {} out of range {}", r, rows.len()))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn run(a_ids: &[&str], b_ids: &[&str]) -> (Intersection, Intersection) {
        let mut a = Psi::new(ids(a_ids)).unwrap();
        let mut b = Psi::new(ids(b_ids)).unwrap();
        assert!(a.intersect_parts().unwrap().is_none());
        let a_for_b = b.re_encrypt("A", a.own_encrypted().to_vec()).unwrap();
        let b_for_a = a.re_encrypt("B", b.own_encrypted().to_vec()).unwrap();
        a.set_own_final(a_for_b).unwrap();
        b.set_own_final(b_for_a).unwrap();
        (
            a.intersect_parts().unwrap().unwrap(),
            b.intersect_parts().unwrap().unwrap(),
        )
    }

    #[test]
    fn test_both_sides_agree() {
        let (ia, ib) = run(&["1", "2", "3", "6"], &["3", "6", "1", "15"]);
        assert_eq!(ia.ids, ids(&["1", "3", "6"]));
        assert_eq!(ib.ids, ia.ids);
        assert_eq!(ia.rows, vec![0, 2, 3]);
        assert_eq!(ib.rows, vec![2, 0, 1]);
    }

    #[test]
    fn test_disjoint_sets() {
        let (ia, ib) = run(&["a", "b"], &["c"]);
        assert!(ia.ids.is_empty());
        assert!(ib.rows.is_empty());
    }

    #[test]
    fn test_intersect_is_idempotent() {
        let mut a = Psi::new(ids(&["x", "y"])).unwrap();
        let mut b = Psi::new(ids(&["y"])).unwrap();
        let a_for_b = b.re_encrypt("A", a.own_encrypted().to_vec()).unwrap();
        a.re_encrypt("B", b.own_encrypted().to_vec()).unwrap();
        a.set_own_final(a_for_b).unwrap();
        let first = a.intersect_parts().unwrap();
        let second = a.intersect_parts().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Psi::new(ids(&["1", "1"])).is_err());
        let mut a = Psi::new(ids(&["1", "2"])).unwrap();
        assert!(a.set_own_final(vec![vec![2u8; 33]]).is_err());
        assert!(a.re_encrypt("B", vec![vec![1u8; 10]]).is_err());
    }

    #[test]
    fn test_rearrange() {
        let inter = Intersection {
            rows: vec![2, 0],
            ids: ids(&["a", "b"]),
        };
        assert_eq!(rearrange(&[10, 20, 30], &inter).unwrap(), vec![30, 10]);
        let bad = Intersection {
            rows: vec![5],
            ids: ids(&["a"]),
        };
        assert_eq!(rearrange(&[1], &bad).unwrap_err().code(), 10014);
    }
}
