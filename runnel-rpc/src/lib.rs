//! RPC layer of the runnel node.
//!
//! Implements the client-facing `StreamService` and the replica-facing
//! `NodeToNode` service on top of tonic, including the quorum write
//! pool, the retrying request forwarder and the multiplexed sync
//! session machinery.

pub mod config;
pub mod forwarder;
pub mod quorum;
pub mod registry;
pub mod sync;

mod error;
mod node2node;
mod server;
mod service;

pub use config::NetworkConfig;
pub use quorum::QuorumPool;
pub use registry::{NodeRegistry, RegistryError};
pub use server::RpcServer;
pub use service::ServiceCore;
