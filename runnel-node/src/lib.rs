//! Stream table and replica topology for the runnel node.
//!
//! This crate owns the node's in-memory view of streams: which replicas
//! host each stream (with sticky-peer selection for forwarding), the
//! cache mapping stream ids to records, and the bridge through which
//! locally hosted streams push updates into sync sessions.

mod cache;
mod memstore;
mod placement;
mod stream;
mod topology;

pub use cache::{CacheError, StreamCache, StreamRecord};
pub use memstore::MemStorage;
pub use placement::{OpenAuth, StaticPlacement};
pub use stream::{LocalStream, LocalSubHandle, SyncError, SyncReceiver};
pub use topology::StreamNodes;
