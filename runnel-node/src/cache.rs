//! In-memory stream table.
//!
//! Maps stream ids to records holding the replica topology and, for
//! locally hosted streams, the subscriber table. Records are created on
//! first use by resolving the placement source and are mutated in place
//! when placement changes.

use crate::stream::{LocalStream, LocalSubHandle, SyncReceiver};
use crate::topology::StreamNodes;
use runnel_model::{NodeAddress, PlacementError, Storage, StorageError, StreamId, StreamPlacement};
use runnel_proto::v1::{Envelope, Miniblock, StreamAndCookie, SyncCookie};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("stream not found: {0}")]
    NotFound(StreamId),

    #[error("stream not hosted on this node: {0}")]
    NotLocal(StreamId),

    #[error("invalid sync cookie: {0}")]
    BadCookie(String),

    #[error(transparent)]
    Placement(PlacementError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One stream as known to this node.
pub struct StreamRecord {
    stream_id: StreamId,
    pub nodes: StreamNodes,
    local: Mutex<Option<Arc<LocalStream>>>,
}

impl StreamRecord {
    fn new(stream_id: StreamId, nodes: StreamNodes) -> Self {
        Self {
            stream_id,
            nodes,
            local: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Subscriber table of this stream; only meaningful on a hosting
    /// node. Created on first use.
    pub fn local_stream(&self) -> Arc<LocalStream> {
        let mut slot = self.local.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(|| Arc::new(LocalStream::new(self.stream_id)))
            .clone()
    }
}

pub struct StreamCache {
    local_address: NodeAddress,
    storage: Arc<dyn Storage>,
    placement: Arc<dyn StreamPlacement>,
    streams: Mutex<HashMap<StreamId, Arc<StreamRecord>>>,
}

impl StreamCache {
    pub fn new(
        local_address: NodeAddress,
        storage: Arc<dyn Storage>,
        placement: Arc<dyn StreamPlacement>,
    ) -> Self {
        Self {
            local_address,
            storage,
            placement,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local_address
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Record a stream whose replica set is already known (write path,
    /// where allocation just returned the node list).
    pub fn register_stream(&self, stream_id: StreamId, nodes: Vec<NodeAddress>) -> Arc<StreamRecord> {
        let mut streams = self.lock();
        streams
            .entry(stream_id)
            .or_insert_with(|| {
                Arc::new(StreamRecord::new(
                    stream_id,
                    StreamNodes::new(nodes, self.local_address),
                ))
            })
            .clone()
    }

    /// Look a stream up, resolving its replica set from the placement
    /// source on first touch.
    pub async fn get_stream(&self, stream_id: StreamId) -> Result<Arc<StreamRecord>, CacheError> {
        if let Some(record) = self.lock().get(&stream_id) {
            return Ok(record.clone());
        }

        let nodes = self
            .placement
            .stream_nodes(stream_id)
            .await
            .map_err(|e| match e {
                PlacementError::NotRegistered(id) => CacheError::NotFound(id),
                other => CacheError::Placement(other),
            })?;

        // A concurrent resolver may have won the race while we awaited.
        let mut streams = self.lock();
        let record = streams
            .entry(stream_id)
            .or_insert_with(|| {
                Arc::new(StreamRecord::new(
                    stream_id,
                    StreamNodes::new(nodes, self.local_address),
                ))
            })
            .clone();
        Ok(record)
    }

    /// Re-resolve placement and apply it to the live record.
    pub async fn refresh_placement(&self, stream_id: StreamId) -> Result<(), CacheError> {
        let record = match self.lock().get(&stream_id) {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        let nodes = self
            .placement
            .stream_nodes(stream_id)
            .await
            .map_err(CacheError::Placement)?;
        tracing::debug!(stream = %stream_id, replicas = nodes.len(), "placement refreshed");
        record.nodes.update(nodes);
        Ok(())
    }

    /// Drop a stream from the table, telling subscribers it is gone.
    pub fn drop_stream(&self, stream_id: StreamId) {
        let record = self.lock().remove(&stream_id);
        if let Some(record) = record {
            tracing::debug!(stream = %stream_id, "dropping stream from table");
            record.local_stream().close();
        }
    }

    /// Subscribe a receiver to a locally hosted stream, delivering the
    /// backfill between the cookie position and the live tail as the
    /// first update.
    pub async fn subscribe_local(
        &self,
        cookie: &SyncCookie,
        receiver: Arc<dyn SyncReceiver>,
    ) -> Result<LocalSubHandle, CacheError> {
        let stream_id = cookie
            .stream_id()
            .map_err(CacheError::BadCookie)?;
        let record = self.get_stream(stream_id).await?;
        if !record.nodes.is_local() {
            return Err(CacheError::NotLocal(stream_id));
        }

        let backfill = self.backfill_update(stream_id, cookie).await?;
        let local = record.local_stream();
        let sub_id = local.subscribe(receiver, Some(backfill));
        Ok(LocalSubHandle::new(local, sub_id))
    }

    /// Cookie for the next incremental read of a hosted stream.
    pub async fn make_cookie(&self, stream_id: StreamId) -> Result<SyncCookie, CacheError> {
        let last = self.storage.last_miniblock_num(stream_id).await?;
        let pooled = self.storage.pending_events(stream_id).await?.len();
        Ok(SyncCookie {
            node_address: self.local_address.as_bytes().to_vec(),
            stream_id: stream_id.as_bytes().to_vec(),
            miniblock_num: last + 1,
            minipool_slot: pooled as i64,
        })
    }

    async fn backfill_update(
        &self,
        stream_id: StreamId,
        cookie: &SyncCookie,
    ) -> Result<StreamAndCookie, CacheError> {
        let last = self.storage.last_miniblock_num(stream_id).await?;
        if cookie.miniblock_num > last + 1 || cookie.miniblock_num < 0 {
            return Err(CacheError::BadCookie(format!(
                "cookie miniblock {} ahead of stream tip {}",
                cookie.miniblock_num, last
            )));
        }

        let miniblocks = self
            .storage
            .read_miniblocks(stream_id, cookie.miniblock_num, -1)
            .await?;
        let pooled = self.storage.pending_events(stream_id).await?;
        let skip = (cookie.minipool_slot.max(0) as usize).min(pooled.len());

        Ok(StreamAndCookie {
            events: pooled[skip..].iter().cloned().map(Envelope::from).collect(),
            miniblocks: miniblocks.into_iter().map(Miniblock::from).collect(),
            next_sync_cookie: Some(SyncCookie {
                node_address: self.local_address.as_bytes().to_vec(),
                stream_id: stream_id.as_bytes().to_vec(),
                miniblock_num: last + 1,
                minipool_slot: pooled.len() as i64,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, Arc<StreamRecord>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}
