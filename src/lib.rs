//! DCP: privacy-preserving data collaboration
//!
//! Two subsystems share one crate:
//! - a two-party vertical federated learning engine (PSI alignment,
//!   Paillier-protected gradient exchange, evaluation) driven by `mpc`
//! - a verifiable storage lifecycle (slicing, per-node encryption,
//!   replication, proof-of-possession challenges, migration) in `storage`

pub mod config;
pub mod crypto;
pub mod error;
pub mod evaluation;
pub mod mpc;
pub mod network;
pub mod psi;
pub mod storage;
pub mod vfl;

pub use config::Settings;
pub use error::{DcpError, Result};
pub use mpc::{MpcNode, NodeConfig};
pub use psi::{Intersection, Psi};
pub use storage::{DataOwner, StorageNode};
pub use vfl::{Algorithm, DataSet, Model, TrainParams, TrainTask};
