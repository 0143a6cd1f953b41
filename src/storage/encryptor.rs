//! Per-replica slice encryption

use super::types::{EncryptedSlice, PlainSlice};
use crate::crypto::sha256;
use crate::crypto::symmetric::{self, SliceKeyContext};
use crate::error::{DcpError, Result};

/// Holds the owner's password; keys are derived per (file, slice, node)
#[derive(Clone)]
pub struct Encryptor {
    password: Vec<u8>,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

impl Encryptor {
    pub fn new(password: &[u8]) -> Result<Self> {
        if password.is_empty() {
            return Err(DcpError::Param("encryption password is empty".into()));
        }
        Ok(Self {
            password: password.to_vec(),
        })
    }

    /// `node_id` is the hex id of the node that will hold the replica
    pub fn encrypt(&self, file_id: &str, slice: &PlainSlice, node_id: &str) -> Result<EncryptedSlice> {
        let node = hex::decode(node_id)?;
        let ctx = SliceKeyContext {
            file_id,
            slice_id: &slice.id,
            node_id: &node,
        };
        let ciphertext = symmetric::encrypt(&self.password, &ctx, &slice.data)?;
        Ok(EncryptedSlice {
            slice_id: slice.id.clone(),
            node_id: node_id.to_string(),
            cipher_hash: sha256(&ciphertext),
            length: ciphertext.len() as u64,
            ciphertext,
        })
    }

    pub fn decrypt(&self, file_id: &str, slice_id: &str, node_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let node = hex::decode(node_id)?;
        let ctx = SliceKeyContext {
            file_id,
            slice_id,
            node_id: &node,
        };
        symmetric::decrypt(&self.password, &ctx, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice() -> PlainSlice {
        PlainSlice {
            id: "s1".into(),
            index: 0,
            hash: sha256(b"hello slice"),
            data: b"hello slice".to_vec(),
        }
    }

    #[test]
    fn test_replicas_differ_and_decrypt() {
        let enc = Encryptor::new(b"owner password").unwrap();
        let a = enc.encrypt("f", &slice(), "aa01").unwrap();
        let b = enc.encrypt("f", &slice(), "bb02").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.cipher_hash, sha256(&a.ciphertext));
        assert_eq!(enc.decrypt("f", "s1", "aa01", &a.ciphertext).unwrap(), b"hello slice");
        // a replica only opens under its own node id
        assert_eq!(enc.decrypt("f", "s1", "bb02", &a.ciphertext).unwrap_err().code(), 10004);
    }
}
