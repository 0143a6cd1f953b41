//! Loading and validation of node settings
//!
//! Settings come from a TOML or JSON file and can be overridden by
//! environment variables prefixed `DCP_`, with `__` between nested keys:
//!
//! ```text
//! DCP_DATA_OWNER__COPIER__REPLICAS=3
//! DCP_LOG__LEVEL=debug
//! ```

use crate::crypto::paillier::MAX_PRIME_BITS;
use crate::error::{DcpError, Result};
use crate::mpc::{NodeConfig, PoolConfig};
use crate::storage::challenger::{ChallengerSettings, MerkleChallenger, PairingChallenger};
use crate::storage::copier::Copier;
use crate::storage::slicer::DEFAULT_BLOCK_SIZE;
use crate::storage::types::ChallengeAlgorithm;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    DataOwner,
    Storage,
}

/// Ledger flavour; both are served by the in-process ledger adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    #[default]
    Xchain,
    Fabric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerSettings {
    pub block_size: usize,
}

impl Default for SlicerSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptorSettings {
    /// Falls back to the owner key bytes when unset
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopierSettings {
    pub replicas: usize,
    pub quorum: usize,
    pub max_retries: u32,
}

impl Default for CopierSettings {
    fn default() -> Self {
        let c = Copier::default();
        Self {
            replicas: c.replicas,
            quorum: c.quorum,
            max_retries: c.max_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleSettings {
    /// Directory of the owner's challenge material store
    #[serde(alias = "leveldb_root")]
    pub material_root: PathBuf,
    pub ranges: usize,
    pub segment_size: usize,
    pub shrink_size: u64,
}

impl Default for MerkleSettings {
    fn default() -> Self {
        let m = MerkleChallenger::default();
        Self {
            material_root: PathBuf::from("dcp-materials"),
            ranges: m.ranges,
            segment_size: m.segment_size,
            shrink_size: m.shrink_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    pub sample_count: usize,
    pub tag_rounds: u64,
}

impl Default for PairingSettings {
    fn default() -> Self {
        let p = PairingChallenger::default();
        Self {
            sample_count: p.sample_count,
            tag_rounds: p.tag_rounds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengerConfig {
    pub algorithm: ChallengeAlgorithm,
    pub interval_secs: u64,
    pub strike_threshold: u32,
    pub merkle: MerkleSettings,
    pub pairing: PairingSettings,
}

impl Default for ChallengerConfig {
    fn default() -> Self {
        Self {
            algorithm: ChallengeAlgorithm::Merkle,
            interval_secs: 3600,
            strike_threshold: 3,
            merkle: MerkleSettings::default(),
            pairing: PairingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOwnerSettings {
    pub address: String,
    /// Hex P-256 secret key, created on first start
    pub key_path: PathBuf,
    pub blockchain: Blockchain,
    /// JSON file backing the in-process ledger; unset keeps it in memory
    pub ledger_path: Option<PathBuf>,
    pub monitor: MonitorSettings,
    pub rpc_timeout_secs: u64,
    pub slicer: SlicerSettings,
    pub encryptor: EncryptorSettings,
    pub copier: CopierSettings,
    pub challenger: ChallengerConfig,
}

impl Default for DataOwnerSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7100".into(),
            key_path: PathBuf::from("dcp-owner.key"),
            blockchain: Blockchain::default(),
            ledger_path: None,
            monitor: MonitorSettings::default(),
            rpc_timeout_secs: 3,
            slicer: SlicerSettings::default(),
            encryptor: EncryptorSettings::default(),
            copier: CopierSettings::default(),
            challenger: ChallengerConfig::default(),
        }
    }
}

impl DataOwnerSettings {
    pub fn copier(&self) -> Copier {
        Copier {
            replicas: self.copier.replicas,
            quorum: self.copier.quorum,
            max_retries: self.copier.max_retries,
        }
    }

    pub fn challenger(&self) -> ChallengerSettings {
        let c = &self.challenger;
        ChallengerSettings {
            algorithm: c.algorithm,
            interval: Duration::from_secs(c.interval_secs),
            strike_threshold: c.strike_threshold,
            merkle: MerkleChallenger {
                ranges: c.merkle.ranges,
                segment_size: c.merkle.segment_size,
                shrink_size: c.merkle.shrink_size,
            },
            pairing: PairingChallenger {
                sample_count: c.pairing.sample_count,
                tag_rounds: c.pairing.tag_rounds,
            },
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.slicer.block_size == 0 {
            return Err(DcpError::Param("data_owner.slicer.block_size must be positive".into()));
        }
        if self.challenger.interval_secs == 0 {
            return Err(DcpError::Param("data_owner.challenger.interval_secs must be positive".into()));
        }
        self.copier().validate()?;
        let challenger = self.challenger();
        challenger.merkle.validate()?;
        challenger.pairing.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub address: String,
    pub key_path: PathBuf,
    pub blockchain: Blockchain,
    pub ledger_path: Option<PathBuf>,
    pub monitor: MonitorSettings,
    /// Directory holding slice blobs
    pub blob_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7200".into(),
            key_path: PathBuf::from("dcp-storage.key"),
            blockchain: Blockchain::default(),
            ledger_path: None,
            monitor: MonitorSettings::default(),
            blob_root: PathBuf::from("dcp-blobs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcSettings {
    pub address: String,
    /// Peers this node may call; empty allows any
    pub peers: Vec<String>,
    pub learner_limit: usize,
    pub rpc_timeout_secs: u64,
    pub rpc_retries: u32,
    pub rpc_backoff_secs: u64,
    pub paillier_bits: usize,
    pub inbox_capacity: usize,
    /// Where finished task results are written
    pub result_dir: PathBuf,
}

impl Default for MpcSettings {
    fn default() -> Self {
        let node = NodeConfig::default();
        let pool = PoolConfig::default();
        Self {
            address: node.local,
            peers: Vec::new(),
            learner_limit: node.learner_limit,
            rpc_timeout_secs: pool.timeout.as_secs(),
            rpc_retries: pool.retries,
            rpc_backoff_secs: pool.backoff.as_secs(),
            paillier_bits: node.paillier_bits,
            inbox_capacity: node.inbox_capacity,
            result_dir: PathBuf::from("dcp-results"),
        }
    }
}

impl MpcSettings {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            local: self.address.clone(),
            learner_limit: self.learner_limit,
            paillier_bits: self.paillier_bits,
            inbox_capacity: self.inbox_capacity,
            ..NodeConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            timeout: Duration::from_secs(self.rpc_timeout_secs),
            retries: self.rpc_retries,
            backoff: Duration::from_secs(self.rpc_backoff_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.learner_limit == 0 || self.inbox_capacity == 0 {
            return Err(DcpError::Param("mpc.learner_limit and mpc.inbox_capacity must be positive".into()));
        }
        if !(64..=MAX_PRIME_BITS).contains(&self.paillier_bits) {
            return Err(DcpError::Param(format!(
                "mpc.paillier_bits {} outside 64..={}",
                self.paillier_bits, MAX_PRIME_BITS
            )));
        }
        if self.rpc_retries == 0 {
            return Err(DcpError::Param("mpc.rpc_retries must be at least 1".into()));
        }
        Ok(())
    }
}

/// The combined settings; `type` picks which node block is required
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub log: LogSettings,
    pub data_owner: Option<DataOwnerSettings>,
    pub storage: Option<StorageSettings>,
    pub mpc: Option<MpcSettings>,
}

impl Settings {
    /// Load from `path`, apply `DCP_*` overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("DCP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        match self.node_type {
            NodeType::DataOwner => self
                .data_owner
                .as_ref()
                .ok_or_else(|| DcpError::Param("type dataOwner needs a data_owner block".into()))?
                .validate()?,
            NodeType::Storage => {
                if self.storage.is_none() {
                    return Err(DcpError::Param("type storage needs a storage block".into()));
                }
            }
        }
        if let Some(mpc) = &self.mpc {
            mpc.validate()?;
        }
        Ok(())
    }

    pub fn data_owner(&self) -> Result<&DataOwnerSettings> {
        self.data_owner
            .as_ref()
            .ok_or_else(|| DcpError::Param("no data_owner block configured".into()))
    }

    pub fn storage(&self) -> Result<&StorageSettings> {
        self.storage
            .as_ref()
            .ok_or_else(|| DcpError::Param("no storage block configured".into()))
    }
}
