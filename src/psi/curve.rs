//! P-256 helpers for commutative encryption
//!
//! Points travel as 33-byte SEC1 compressed encodings.

use crate::crypto::sha256;
use crate::error::{DcpError, Result};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{AffinePoint, EncodedPoint, NonZeroScalar, ProjectivePoint};
use rand::rngs::OsRng;

/// Length of a compressed point
pub const POINT_LEN: usize = 33;

/// Maximum rejection-sampling attempts of `hash_to_point`
pub const MAX_HASH_TRIES: u32 = 64;

/// Fresh secret exponent
pub fn random_key() -> NonZeroScalar {
    NonZeroScalar::random(&mut OsRng)
}

/// Map an identifier onto the curve: `x = SHA256(ctr ‖ id)`, even-y point
pub fn hash_to_point(id: &str) -> Result<ProjectivePoint> {
    let mut buf = Vec::with_capacity(4 + id.len());
    for ctr in 0..MAX_HASH_TRIES {
        buf.clear();
        buf.extend_from_slice(&ctr.to_be_bytes());
        buf.extend_from_slice(id.as_bytes());
        let x = sha256(&buf);
        let mut compressed = [0u8; POINT_LEN];
        compressed[0] = 0x02;
        compressed[1..].copy_from_slice(&x);
        if let Ok(point) = decode_point(&compressed) {
            return Ok(point);
        }
    }
    Err(DcpError::Internal(format!(
        "hash to curve exceeded {} tries",
        MAX_HASH_TRIES
    )))
}

pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    if bytes.len() != POINT_LEN {
        return Err(DcpError::Param(format!(
            "encrypted id has length {}, expected {}",
            bytes.len(),
            POINT_LEN
        )));
    }
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|e| DcpError::Encoding(format!("sec1 point: {}", e)))?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    affine
        .map(ProjectivePoint::from)
        .ok_or_else(|| DcpError::Encoding("bytes are not a curve point".into()))
}

/// Raise an encoded point to the secret exponent
pub fn exponentiate(bytes: &[u8], key: &NonZeroScalar) -> Result<Vec<u8>> {
    let point = decode_point(bytes)?;
    Ok(encode_point(&(point * key.as_ref())))
}
