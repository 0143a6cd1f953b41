//! Per-slice symmetric encryption: HKDF-SHA512 + AES-256-GCM
//!
//! Every (file, slice, node) triple gets its own key, so the same plaintext
//! replicated to three nodes yields three unrelated ciphertexts. The nonce is
//! derived from the same salt; keys are never reused across triples.

use super::sha256;
use crate::error::{DcpError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha512;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Identifies the slice replica a key is bound to
#[derive(Debug, Clone, Copy)]
pub struct SliceKeyContext<'a> {
    pub file_id: &'a str,
    pub slice_id: &'a str,
    pub node_id: &'a [u8],
}

impl SliceKeyContext<'_> {
    fn salt(&self) -> Vec<u8> {
        let mut salt =
            Vec::with_capacity(self.file_id.len() + self.slice_id.len() + self.node_id.len());
        salt.extend_from_slice(self.file_id.as_bytes());
        salt.extend_from_slice(self.slice_id.as_bytes());
        salt.extend_from_slice(self.node_id);
        salt
    }
}

/// Derive the AES key and GCM nonce for one replica
pub fn derive_key(password: &[u8], ctx: &SliceKeyContext<'_>) -> Result<([u8; KEY_LEN], [u8; NONCE_LEN])> {
    if password.is_empty() {
        return Err(DcpError::Param("encryption password is empty".into()));
    }
    let salt = ctx.salt();
    let hk = Hkdf::<Sha512>::new(Some(&salt), password);
    let mut key = [0u8; KEY_LEN];
    hk.expand(&[], &mut key)
        .map_err(|e| DcpError::Internal(format!("hkdf expand: {}", e)))?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&sha256(&salt)[..NONCE_LEN]);
    Ok((key, nonce))
}

/// Encrypt a slice for one replica
pub fn encrypt(password: &[u8], ctx: &SliceKeyContext<'_>, plaintext: &[u8]) -> Result<Vec<u8>> {
    let (key, nonce) = derive_key(password, ctx)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| DcpError::Encoding("aes-gcm encryption failed".into()))
}

/// Decrypt a slice replica; authentication failures are `Encoding` errors
pub fn decrypt(password: &[u8], ctx: &SliceKeyContext<'_>, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (key, nonce) = derive_key(password, ctx)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher.decrypt(Nonce::from_slice(&nonce), ciphertext).map_err(|_| {
        DcpError::Encoding(format!(
            "slice {} of file {} failed authentication",
            ctx.slice_id, ctx.file_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(node: &'a [u8]) -> SliceKeyContext<'a> {
        SliceKeyContext {
            file_id: "file-1",
            slice_id: "slice-1",
            node_id: node,
        }
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let plain = b"some slice bytes".to_vec();
        let ct = encrypt(b"pw", &ctx(b"node-a"), &plain).unwrap();
        assert_ne!(ct, plain);
        assert_eq!(decrypt(b"pw", &ctx(b"node-a"), &ct).unwrap(), plain);
    }

    #[test]
    fn test_replicas_differ_per_node() {
        let plain = vec![9u8; 64];
        let a = encrypt(b"pw", &ctx(b"node-a"), &plain).unwrap();
        let b = encrypt(b"pw", &ctx(b"node-b"), &plain).unwrap();
        assert_ne!(a, b);
        assert!(decrypt(b"pw", &ctx(b"node-b"), &a).is_err());
    }

    #[test]
    fn test_wrong_password_or_tamper_fails() {
        let mut ct = encrypt(b"pw", &ctx(b"n"), b"hello").unwrap();
        assert!(decrypt(b"other", &ctx(b"n"), &ct).is_err());
        ct[0] ^= 1;
        let err = decrypt(b"pw", &ctx(b"n"), &ct).unwrap_err();
        assert_eq!(err.code(), 10004);
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(encrypt(b"", &ctx(b"n"), b"x").is_err());
    }
}
