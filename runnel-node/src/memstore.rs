//! In-memory storage backend.
//!
//! Backs the dev daemon and the test suites. Not durable; the
//! production engine lives behind the same `Storage` trait.

use async_trait::async_trait;
use runnel_model::{EventRecord, MiniblockRecord, Storage, StorageError, StreamId};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct StreamSlot {
    miniblocks: Vec<MiniblockRecord>,
    minipool: Vec<EventRecord>,
}

#[derive(Default)]
pub struct MemStorage {
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn create_stream(
        &self,
        stream_id: StreamId,
        genesis: MiniblockRecord,
    ) -> Result<(), StorageError> {
        let mut streams = self.lock();
        if streams.contains_key(&stream_id) {
            return Err(StorageError::AlreadyExists(stream_id));
        }
        if genesis.num != 0 {
            return Err(StorageError::BadMiniblockNum {
                stream: stream_id,
                got: genesis.num,
                expected: 0,
            });
        }
        streams.insert(
            stream_id,
            StreamSlot {
                miniblocks: vec![genesis],
                minipool: Vec::new(),
            },
        );
        Ok(())
    }

    async fn stream_exists(&self, stream_id: StreamId) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(&stream_id))
    }

    async fn append_event(
        &self,
        stream_id: StreamId,
        event: EventRecord,
    ) -> Result<u64, StorageError> {
        let mut streams = self.lock();
        let slot = streams
            .get_mut(&stream_id)
            .ok_or(StorageError::NotFound(stream_id))?;
        slot.minipool.push(event);
        Ok((slot.minipool.len() - 1) as u64)
    }

    async fn pending_events(&self, stream_id: StreamId) -> Result<Vec<EventRecord>, StorageError> {
        let streams = self.lock();
        let slot = streams
            .get(&stream_id)
            .ok_or(StorageError::NotFound(stream_id))?;
        Ok(slot.minipool.clone())
    }

    async fn read_miniblocks(
        &self,
        stream_id: StreamId,
        from_inclusive: i64,
        to_exclusive: i64,
    ) -> Result<Vec<MiniblockRecord>, StorageError> {
        let streams = self.lock();
        let slot = streams
            .get(&stream_id)
            .ok_or(StorageError::NotFound(stream_id))?;
        let len = slot.miniblocks.len() as i64;
        let from = from_inclusive.clamp(0, len);
        let to = if to_exclusive < 0 {
            len
        } else {
            to_exclusive.clamp(from, len)
        };
        Ok(slot.miniblocks[from as usize..to as usize].to_vec())
    }

    async fn last_miniblock_num(&self, stream_id: StreamId) -> Result<i64, StorageError> {
        let streams = self.lock();
        let slot = streams
            .get(&stream_id)
            .ok_or(StorageError::NotFound(stream_id))?;
        Ok(slot.miniblocks.len() as i64 - 1)
    }

    async fn seal_miniblock(
        &self,
        stream_id: StreamId,
        miniblock: MiniblockRecord,
        covered: usize,
    ) -> Result<(), StorageError> {
        let mut streams = self.lock();
        let slot = streams
            .get_mut(&stream_id)
            .ok_or(StorageError::NotFound(stream_id))?;
        let expected = slot.miniblocks.len() as i64;
        if miniblock.num != expected {
            return Err(StorageError::BadMiniblockNum {
                stream: stream_id,
                got: miniblock.num,
                expected,
            });
        }
        if covered > slot.minipool.len() {
            return Err(StorageError::MinipoolMismatch {
                stream: stream_id,
                sealing: covered,
                pooled: slot.minipool.len(),
            });
        }
        slot.miniblocks.push(miniblock);
        slot.minipool.drain(..covered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> StreamId {
        StreamId([b; 32])
    }

    fn event(b: u8) -> EventRecord {
        EventRecord {
            hash: vec![b; 32],
            payload: vec![b],
        }
    }

    fn block(num: i64, events: Vec<EventRecord>) -> MiniblockRecord {
        MiniblockRecord {
            num,
            header_hash: vec![num as u8; 32],
            events,
        }
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let store = MemStorage::new();
        store.create_stream(id(1), block(0, vec![])).await.unwrap();
        let err = store
            .create_stream(id(1), block(0, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn append_and_seal_rolls_the_pool() {
        let store = MemStorage::new();
        store.create_stream(id(1), block(0, vec![])).await.unwrap();
        assert_eq!(store.append_event(id(1), event(1)).await.unwrap(), 0);
        assert_eq!(store.append_event(id(1), event(2)).await.unwrap(), 1);

        store
            .seal_miniblock(id(1), block(1, vec![event(1), event(2)]), 2)
            .await
            .unwrap();
        assert_eq!(store.last_miniblock_num(id(1)).await.unwrap(), 1);
        assert!(store.pending_events(id(1)).await.unwrap().is_empty());
        // Slots restart after sealing.
        assert_eq!(store.append_event(id(1), event(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seal_rejects_gaps() {
        let store = MemStorage::new();
        store.create_stream(id(1), block(0, vec![])).await.unwrap();
        let err = store
            .seal_miniblock(id(1), block(5, vec![]), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BadMiniblockNum { expected: 1, .. }));
    }

    #[tokio::test]
    async fn read_miniblocks_ranges() {
        let store = MemStorage::new();
        store.create_stream(id(1), block(0, vec![])).await.unwrap();
        store.seal_miniblock(id(1), block(1, vec![]), 0).await.unwrap();
        store.seal_miniblock(id(1), block(2, vec![]), 0).await.unwrap();

        let all = store.read_miniblocks(id(1), 0, -1).await.unwrap();
        assert_eq!(all.len(), 3);
        let tail = store.read_miniblocks(id(1), 1, -1).await.unwrap();
        assert_eq!(tail.first().unwrap().num, 1);
        let mid = store.read_miniblocks(id(1), 1, 2).await.unwrap();
        assert_eq!(mid.len(), 1);
    }

    #[tokio::test]
    async fn missing_stream_is_not_found() {
        let store = MemStorage::new();
        let err = store.pending_events(id(9)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
