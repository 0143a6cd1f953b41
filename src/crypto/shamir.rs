//! Shamir secret sharing over the P-256 group order
//!
//! A secret (big-endian integer below the order) is hidden in the constant
//! term of a random polynomial of degree `threshold - 1`; shares are the
//! evaluations at x = 1..=count. Any `threshold` shares recover it by
//! Lagrange interpolation at zero.

use super::bigint_hex;
use crate::error::{DcpError, Result};
use num_bigint::{BigUint, RandBigInt};
use p256::elliptic_curve::bigint::Encoding;
use p256::elliptic_curve::Curve;
use p256::NistP256;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Width of a recovered secret in bytes
pub const SECRET_LEN: usize = 32;

/// One evaluation point of the sharing polynomial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub x: u32,
    #[serde(with = "bigint_hex")]
    pub y: BigUint,
}

/// Order of the P-256 base point
fn order() -> BigUint {
    BigUint::from_bytes_be(&NistP256::ORDER.to_be_bytes())
}

/// Split `secret` into `count` shares, any `threshold` of which recover it
pub fn split(secret: &[u8], count: usize, threshold: usize) -> Result<Vec<Share>> {
    if threshold == 0 || count == 0 {
        return Err(DcpError::Param("share count and threshold must be positive".into()));
    }
    if threshold > count {
        return Err(DcpError::Param(format!(
            "threshold {} exceeds share count {}",
            threshold, count
        )));
    }
    if count > u32::MAX as usize {
        return Err(DcpError::Param("share count too large".into()));
    }
    let p = order();
    let s = BigUint::from_bytes_be(secret);
    if s >= p {
        return Err(DcpError::Param("secret is not below the group order".into()));
    }

    let mut rng = rand::thread_rng();
    let mut coeffs = Vec::with_capacity(threshold);
    coeffs.push(s);
    for i in 1..threshold {
        let c = if i == threshold - 1 {
            // leading coefficient must be a nonzero field element
            loop {
                let c = rng.gen_biguint_below(&p);
                if !c.is_zero() {
                    break c;
                }
            }
        } else {
            rng.gen_biguint_below(&p)
        };
        coeffs.push(c);
    }

    let shares = (1..=count as u32)
        .map(|x| {
            let xb = BigUint::from(x);
            // Horner evaluation from the highest coefficient
            let y = coeffs
                .iter()
                .rev()
                .fold(BigUint::zero(), |acc, c| (acc * &xb + c) % &p);
            Share { x, y }
        })
        .collect();
    Ok(shares)
}

/// Recover the secret from at least `threshold` distinct shares
pub fn recover(shares: &[Share]) -> Result<Vec<u8>> {
    if shares.is_empty() {
        return Err(DcpError::Param("no shares to recover from".into()));
    }
    let mut seen = HashSet::new();
    for s in shares {
        if s.x == 0 || !seen.insert(s.x) {
            return Err(DcpError::Param(format!("invalid or duplicate share x={}", s.x)));
        }
    }
    let p = order();
    let mut secret = BigUint::zero();
    for (j, sj) in shares.iter().enumerate() {
        let xj = BigUint::from(sj.x);
        let mut num = BigUint::from(1u32);
        let mut den = BigUint::from(1u32);
        for (m, sm) in shares.iter().enumerate() {
            if m == j {
                continue;
            }
            let xm = BigUint::from(sm.x);
            num = (num * &xm) % &p;
            den = (den * ((&xm + &p - &xj) % &p)) % &p;
        }
        let inv = den
            .modinv(&p)
            .ok_or_else(|| DcpError::Internal("lagrange denominator not invertible".into()))?;
        let term = (&sj.y % &p) * num % &p * inv % &p;
        secret = (secret + term) % &p;
    }

    let bytes = secret.to_bytes_be();
    let mut out = vec![0u8; SECRET_LEN.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        hex::decode("deadbeef00112233445566778899aabbccddeeff0102030405060708090a0b0c").unwrap()
    }

    #[test]
    fn test_split_and_recover_with_threshold() {
        let shares = split(&secret(), 5, 3).unwrap();
        assert_eq!(shares.len(), 5);
        assert_eq!(recover(&shares[..3]).unwrap(), secret());
        assert_eq!(recover(&shares[2..]).unwrap(), secret());
        assert_eq!(recover(&shares).unwrap(), secret());
    }

    #[test]
    fn test_field_is_p256_group_order() {
        let expected = BigUint::parse_bytes(
            b"FFFFFFFF00000000FFFFFFFFFFFFFFFFBCE6FAADA7179E84F3B9CAC2FC632551",
            16,
        )
        .unwrap();
        assert_eq!(order(), expected);
    }

    #[test]
    fn test_below_threshold_does_not_recover() {
        let shares = split(&secret(), 5, 3).unwrap();
        assert_ne!(recover(&shares[..2]).unwrap(), secret());
    }

    #[test]
    fn test_small_secret_is_left_padded() {
        let shares = split(&[7u8], 3, 2).unwrap();
        let out = recover(&shares[1..]).unwrap();
        assert_eq!(out.len(), SECRET_LEN);
        assert_eq!(out[31], 7);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(split(&secret(), 2, 3).is_err());
        assert!(split(&[0xff; 32], 3, 2).is_err());
        let shares = split(&secret(), 3, 2).unwrap();
        assert!(recover(&[shares[0].clone(), shares[0].clone()]).is_err());
        assert!(recover(&[]).is_err());
    }
}
