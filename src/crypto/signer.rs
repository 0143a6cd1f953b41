//! Node identity: ECDSA over P-256
//!
//! A node's id is its SEC1-compressed public key. Storage requests and
//! ledger records are signed with the matching secret key.

use crate::error::{DcpError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use std::path::Path;

/// ECDSA keypair identifying a node or data owner
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("id", &hex::encode(self.public_key()))
            .finish()
    }
}

impl NodeKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Rebuild from the 32-byte big-endian secret scalar
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_slice(bytes)
            .map_err(|e| DcpError::Encoding(format!("ecdsa secret key: {}", e)))?;
        Ok(Self { signing })
    }

    /// Load the hex-encoded secret at `path`, creating one when absent
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim())?;
            return Self::from_secret_bytes(&bytes);
        }
        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(key.secret_bytes()))?;
        log::info!("Generated node key at {}", path.display());
        Ok(key)
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing.to_bytes().to_vec()
    }

    /// SEC1 compressed public key, used as the node id
    pub fn public_key(&self) -> Vec<u8> {
        self.signing
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Hex form of the node id
    pub fn id_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// 64-byte fixed-width signature
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing.sign(msg);
        sig.to_bytes().to_vec()
    }
}

/// Check a fixed-width signature against a SEC1 public key
pub fn verify(public_key: &[u8], msg: &[u8], signature: &[u8]) -> Result<bool> {
    let vk = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| DcpError::Encoding(format!("ecdsa public key: {}", e)))?;
    let sig = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    Ok(vk.verify(msg, &sig).is_ok())
}
