//! Key → bytes blob stores used by storage nodes

use crate::error::{DcpError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub trait BlobStore: Send + Sync {
    /// Store a new blob; an existing key is `AlreadyExists`
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    /// Replace an existing blob
    fn update(&self, key: &str, data: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Keys must be plain file names
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
        return Err(DcpError::Param(format!("invalid blob key {:?}", key)));
    }
    Ok(())
}

/// Blobs as files at `<root>/<key>`
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for LocalFsStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if path.exists() {
            return Err(DcpError::AlreadyExists(format!("blob {}", key)));
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    fn update(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if !path.exists() {
            return Err(DcpError::NotFound(format!("blob {}", key)));
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DcpError::NotFound(format!("blob {}", key)),
            _ => DcpError::Io(e),
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.exists())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        std::fs::remove_file(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DcpError::NotFound(format!("blob {}", key)),
            _ => DcpError::Io(e),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a blob in place, bypassing `update` checks
    pub fn corrupt(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) {
        if let Ok(mut blobs) = self.blobs.write() {
            if let Some(data) = blobs.get_mut(key) {
                f(data);
            }
        }
    }

    fn poisoned() -> DcpError {
        DcpError::Internal("memory store poisoned".into())
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        check_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| Self::poisoned())?;
        if blobs.contains_key(key) {
            return Err(DcpError::AlreadyExists(format!("blob {}", key)));
        }
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn update(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| Self::poisoned())?;
        match blobs.get_mut(key) {
            Some(slot) => {
                *slot = data.to_vec();
                Ok(())
            }
            None => Err(DcpError::NotFound(format!("blob {}", key))),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().map_err(|_| Self::poisoned())?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| DcpError::NotFound(format!("blob {}", key)))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let blobs = self.blobs.read().map_err(|_| Self::poisoned())?;
        Ok(blobs.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| Self::poisoned())?;
        blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DcpError::NotFound(format!("blob {}", key)))
    }
}
