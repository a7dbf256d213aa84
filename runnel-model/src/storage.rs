//! Storage seam for the durable log engine.
//!
//! The node consumes storage through this trait only: miniblocks are
//! opaque batches of committed events, the minipool holds events that
//! have been quorum-committed but not yet sealed into a miniblock.
//! Persistence, indexing and compaction are the engine's business.

use crate::types::StreamId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("stream not found: {0}")]
    NotFound(StreamId),

    #[error("stream already exists: {0}")]
    AlreadyExists(StreamId),

    #[error("bad miniblock number for {stream}: got {got}, expected {expected}")]
    BadMiniblockNum {
        stream: StreamId,
        got: i64,
        expected: i64,
    },

    #[error("minipool slot mismatch for {stream}: sealing {sealing} of {pooled} pooled events")]
    MinipoolMismatch {
        stream: StreamId,
        sealing: usize,
        pooled: usize,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One event as stored: content hash plus opaque payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub hash: Vec<u8>,
    pub payload: Vec<u8>,
}

/// One sealed miniblock: a numbered batch of events with a header hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiniblockRecord {
    pub num: i64,
    pub header_hash: Vec<u8>,
    pub events: Vec<EventRecord>,
}

/// Append/read surface of the durable log engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a stream replica with its genesis miniblock (number 0).
    async fn create_stream(
        &self,
        stream_id: StreamId,
        genesis: MiniblockRecord,
    ) -> Result<(), StorageError>;

    async fn stream_exists(&self, stream_id: StreamId) -> Result<bool, StorageError>;

    /// Append one event to the stream's minipool. Returns the slot the
    /// event landed in (monotonic within the current minipool).
    async fn append_event(
        &self,
        stream_id: StreamId,
        event: EventRecord,
    ) -> Result<u64, StorageError>;

    /// Events currently pooled and not yet covered by a miniblock.
    async fn pending_events(&self, stream_id: StreamId) -> Result<Vec<EventRecord>, StorageError>;

    /// Miniblocks in `[from_inclusive, to_exclusive)`. A `to_exclusive`
    /// of `-1` means "through the latest".
    async fn read_miniblocks(
        &self,
        stream_id: StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<MiniblockRecord>, StorageError>;

    async fn last_miniblock_num(&self, stream_id: StreamId) -> Result<i64, StorageError>;

    /// Store a sealed miniblock and drop the first `covered` events from
    /// the minipool. The miniblock number must be contiguous.
    async fn seal_miniblock(
        &self,
        stream_id: StreamId,
        miniblock: MiniblockRecord,
        covered: usize,
    ) -> Result<(), StorageError>;
}
