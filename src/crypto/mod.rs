//! Cryptographic primitives
//!
//! - `paillier`: additively homomorphic encryption for gradient exchange
//! - `pdp`: pairing-based provable data possession over BN254
//! - `shamir`: threshold secret sharing over the P-256 group order
//! - `merkle`: SHA-256 Merkle roots for range challenges
//! - `symmetric`: per-slice HKDF + AES-256-GCM
//! - `signer`: ECDSA P-256 node identities

pub mod merkle;
pub mod paillier;
pub mod pdp;
pub mod shamir;
pub mod signer;
pub mod symmetric;

use sha2::{Digest, Sha256};

/// SHA-256 of a byte string
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Serde adapter writing big unsigned integers as lowercase hex strings
pub mod bigint_hex {
    use num_bigint::BigUint;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_str_radix(16))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(d)?;
        BigUint::parse_bytes(s.as_bytes(), 16)
            .ok_or_else(|| D::Error::custom(format!("invalid hex integer {:?}", s)))
    }
}

/// Serde adapter writing byte vectors as hex strings
pub mod bytes_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}

/// Serde adapter for lists of byte strings (encrypted ids, points)
pub mod vec_bytes_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(d)?;
        items
            .iter()
            .map(|s| hex::decode(s).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
