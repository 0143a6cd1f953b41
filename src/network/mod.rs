//! Network module: framed JSON request/response over tokio TCP
//!
//! Carries MPC `StepRequest`s between compute nodes and storage requests
//! between data owners and storage nodes.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::Connection;
pub use protocol::{Envelope, Reply, MAX_FRAME_LEN, PROTOCOL_VERSION};
pub use server::{Handler, Server};
