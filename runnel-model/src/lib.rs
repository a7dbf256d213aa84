//! Core model for the runnel stream node.
//!
//! Strong id types, the opaque event/miniblock records, and the trait
//! seams behind which the durable storage engine, the stream placement
//! source, and the admissibility rules live. Everything network-facing
//! builds on top of this crate; nothing here touches the wire.

pub mod placement;
pub mod storage;
pub mod types;

pub use placement::{AuthError, ChainAuth, PlacementError, StreamPlacement};
pub use storage::{EventRecord, MiniblockRecord, Storage, StorageError};
pub use types::{NodeAddress, StreamId};
