//! Placement and admissibility seams.
//!
//! Which nodes replicate a stream is decided by an external registry
//! (on-chain in production); whether an event is admissible is decided
//! by an external rule engine. Both are consumed through narrow traits.

use crate::storage::EventRecord;
use crate::types::{NodeAddress, StreamId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("stream not registered: {0}")]
    NotRegistered(StreamId),

    #[error("no nodes available for placement")]
    NoNodes,

    #[error("placement source error: {0}")]
    Source(String),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("event rejected for {stream}: {reason}")]
    Rejected { stream: StreamId, reason: String },

    #[error("auth source error: {0}")]
    Source(String),
}

/// Resolves which node addresses hold replicas of a stream.
#[async_trait]
pub trait StreamPlacement: Send + Sync {
    /// Pick the replica set for a new stream and record it.
    async fn allocate_stream(&self, stream_id: StreamId)
        -> Result<Vec<NodeAddress>, PlacementError>;

    /// Current replica set of an existing stream.
    async fn stream_nodes(&self, stream_id: StreamId) -> Result<Vec<NodeAddress>, PlacementError>;
}

/// Admissibility check applied before an event is committed.
#[async_trait]
pub trait ChainAuth: Send + Sync {
    async fn check_event(&self, stream_id: StreamId, event: &EventRecord) -> Result<(), AuthError>;
}
