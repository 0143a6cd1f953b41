//! Verifiable storage lifecycle
//!
//! A data owner slices a file, encrypts every slice once per holding node,
//! replicates it across storage nodes and publishes the file record to the
//! ledger. Possession is audited with Merkle range or pairing challenges;
//! nodes that keep failing are replaced by migrating their replicas.

pub mod blob;
pub mod chain;
pub mod challenger;
pub mod client;
pub mod copier;
pub mod encryptor;
pub mod material;
pub mod node;
pub mod owner;
pub mod slicer;
pub mod types;

pub use blob::{BlobStore, LocalFsStore, MemoryStore};
pub use chain::{Ledger, MemoryChain};
pub use challenger::{ChallengerSettings, MerkleChallenger, PairingChallenger};
pub use client::{LocalStorageNetwork, StorageClient, TcpStorageClient};
pub use copier::Copier;
pub use encryptor::Encryptor;
pub use material::MaterialStore;
pub use node::{StorageNode, StorageRequest, StorageResponse};
pub use owner::DataOwner;
pub use slicer::Slicer;
pub use types::{ChallengeAlgorithm, FileRecord, Health, NodeRecord, ProofBundle, SliceMeta};
