//! Owner-side challenge material store
//!
//! Everything the owner must remember to audit its files: Merkle ranges per
//! replica (keyed `"{file_id}:{slice_id}:{hex node_id}"`), PDP secrets per
//! file, challenge round counters and node strikes.
//!
//! Persisted as `materials.json` plus a `manifest.json` carrying a version
//! and SHA256 checksum; a checksum mismatch on open is an `Encoding` error.

use super::challenger::{merkle, ChallengeRange, MerkleMaterial, PairingSecret, Strikes};
use crate::error::{DcpError, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A file uploaded by this owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedFile {
    pub file_id: String,
    pub name: String,
    pub ns: String,
    /// Challenge rounds issued so far
    pub rounds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Materials {
    pub merkle: BTreeMap<String, MerkleMaterial>,
    pub pairing: BTreeMap<String, PairingSecret>,
    pub files: BTreeMap<String, OwnedFile>,
    pub strikes: Strikes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialManifest {
    pub version: u64,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
    pub merkle_count: usize,
}

#[derive(Debug)]
pub struct MaterialStore {
    dir: Option<PathBuf>,
    version: u64,
    data: Materials,
}

impl MaterialStore {
    /// Not persisted
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            version: 0,
            data: Materials::default(),
        }
    }

    /// Load the store under `dir` or start an empty one
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            std::fs::create_dir_all(dir)?;
            return Ok(Self {
                dir: Some(dir.to_path_buf()),
                version: 0,
                data: Materials::default(),
            });
        }
        let manifest: MaterialManifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
        let json = std::fs::read_to_string(dir.join("materials.json"))?;
        let checksum = hex::encode(Sha256::digest(json.as_bytes()));
        if checksum != manifest.checksum {
            return Err(DcpError::Encoding(format!(
                "material store v{} checksum mismatch: expected {}, got {}",
                manifest.version, manifest.checksum, checksum
            )));
        }
        let data: Materials = serde_json::from_str(&json)?;
        info!(
            "Loaded material store v{}: {} files, {} merkle materials",
            manifest.version,
            data.files.len(),
            data.merkle.len()
        );
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            version: manifest.version,
            data,
        })
    }

    fn save(&mut self) -> Result<()> {
        let dir = match &self.dir {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        let json = serde_json::to_string(&self.data)?;
        let manifest = MaterialManifest {
            version: self.version + 1,
            checksum: hex::encode(Sha256::digest(json.as_bytes())),
            updated_at: Utc::now(),
            merkle_count: self.data.merkle.len(),
        };
        std::fs::write(dir.join("materials.json"), json)?;
        std::fs::write(dir.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;
        self.version = manifest.version;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn add_file(&mut self, file: OwnedFile) -> Result<()> {
        self.data.files.insert(file.file_id.clone(), file);
        self.save()
    }

    pub fn files(&self) -> Vec<OwnedFile> {
        self.data.files.values().cloned().collect()
    }

    pub fn file(&self, file_id: &str) -> Option<&OwnedFile> {
        self.data.files.get(file_id)
    }

    /// Bump and return the challenge round of a file
    pub fn next_round(&mut self, file_id: &str) -> Result<u64> {
        let file = self
            .data
            .files
            .get_mut(file_id)
            .ok_or_else(|| DcpError::NotFound(format!("owned file {}", file_id)))?;
        let round = file.rounds;
        file.rounds += 1;
        self.save()?;
        Ok(round)
    }

    pub fn put_merkle(&mut self, materials: Vec<MerkleMaterial>) -> Result<()> {
        for m in materials {
            self.data.merkle.insert(m.key(), m);
        }
        self.save()
    }

    pub fn merkle(&self, file_id: &str, slice_id: &str, node_id: &str) -> Option<&MerkleMaterial> {
        self.data.merkle.get(&merkle::material_key(file_id, slice_id, node_id))
    }

    /// Spend the next unused range of a replica; persisted before returning
    pub fn take_range(&mut self, file_id: &str, slice_id: &str, node_id: &str) -> Result<ChallengeRange> {
        let key = merkle::material_key(file_id, slice_id, node_id);
        let range = self
            .data
            .merkle
            .get_mut(&key)
            .ok_or_else(|| DcpError::NotFound(format!("challenge material {}", key)))?
            .take()?;
        self.save()?;
        Ok(range)
    }

    pub fn remove_merkle(&mut self, file_id: &str, slice_id: &str, node_id: &str) -> Result<()> {
        self.data
            .merkle
            .remove(&merkle::material_key(file_id, slice_id, node_id));
        self.save()
    }

    pub fn put_pairing(&mut self, secret: PairingSecret) -> Result<()> {
        self.data.pairing.insert(secret.file_id.clone(), secret);
        self.save()
    }

    pub fn pairing(&self, file_id: &str) -> Result<&PairingSecret> {
        self.data
            .pairing
            .get(file_id)
            .ok_or_else(|| DcpError::NotFound(format!("pairing secret of {}", file_id)))
    }

    /// Drop every material of a file
    pub fn remove_file(&mut self, file_id: &str) -> Result<()> {
        let prefix = format!("{}:", file_id);
        self.data.merkle.retain(|k, _| !k.starts_with(&prefix));
        self.data.pairing.remove(file_id);
        self.data.files.remove(file_id);
        self.save()
    }

    pub fn strikes(&self) -> &Strikes {
        &self.data.strikes
    }

    /// Update strikes and persist
    pub fn with_strikes<T>(&mut self, f: impl FnOnce(&mut Strikes) -> T) -> Result<T> {
        let out = f(&mut self.data.strikes);
        self.save()?;
        Ok(out)
    }
}
