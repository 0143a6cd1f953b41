//! MPC node: concurrency core of the training service
//!
//! A node owns a bounded task registry, one actor per running learner or
//! predictor, and a coordinator that drives evaluators. Peers exchange
//! `Step` requests through a `Transport`.

pub mod actor;
pub mod node;
pub mod registry;
pub mod result;
pub mod transport;
pub mod wire;

pub use actor::{Inbound, StopKind, TaskEvent, TaskHandle};
pub use node::{MpcNode, NodeConfig, NodeInner};
pub use registry::Registry;
pub use result::{FileResults, MemoryResults, Outcomes, ResultHandler};
pub use transport::{LocalTransport, PeerPool, PoolConfig, StepHandler, Transport};
pub use wire::{PredictRequest, StepAck, StepRequest, TrainRequest};
