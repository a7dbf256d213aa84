//! Local subscription bridge.
//!
//! A locally hosted stream pushes updates through the `SyncReceiver`
//! callback surface into whichever sync sessions are subscribed. The
//! bridge decouples the storage/cache layer from session lifetimes: a
//! session registers a receiver, the stream fans updates out to every
//! registered receiver, and unsubscribing is keyed by handle id.

use runnel_model::StreamId;
use runnel_proto::v1::StreamAndCookie;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Session-level failures of the sync path.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("update queue full for stream {0}")]
    QueueFull(StreamId),

    #[error("sync protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sync cancelled")]
    Cancelled,
}

/// Callback surface a hosted stream (or a remote relay) uses to push
/// results into a sync session. Implementations must not block.
pub trait SyncReceiver: Send + Sync {
    fn on_update(&self, update: StreamAndCookie);
    fn on_stream_down(&self, stream_id: StreamId);
    fn on_sync_error(&self, err: SyncError);
    fn on_close(&self);
}

/// Subscriber table of one locally hosted stream.
pub struct LocalStream {
    stream_id: StreamId,
    next_sub: AtomicU64,
    subs: Mutex<HashMap<u64, Arc<dyn SyncReceiver>>>,
}

impl LocalStream {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            next_sub: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Register a receiver, delivering `backfill` before any live update
    /// so the subscriber observes the stream in order. Returns the
    /// handle id used to unsubscribe.
    pub fn subscribe(
        &self,
        receiver: Arc<dyn SyncReceiver>,
        backfill: Option<StreamAndCookie>,
    ) -> u64 {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.lock();
        if let Some(update) = backfill {
            receiver.on_update(update);
        }
        subs.insert(id, receiver);
        id
    }

    pub fn unsubscribe(&self, sub_id: u64) {
        self.lock().remove(&sub_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Fan one update out to every subscriber.
    pub fn notify(&self, update: &StreamAndCookie) {
        let subs = self.lock();
        for receiver in subs.values() {
            receiver.on_update(update.clone());
        }
    }

    /// Tell every subscriber the stream is gone and drop them all.
    pub fn close(&self) {
        let drained: Vec<Arc<dyn SyncReceiver>> = {
            let mut subs = self.lock();
            subs.drain().map(|(_, r)| r).collect()
        };
        for receiver in drained {
            receiver.on_stream_down(self.stream_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn SyncReceiver>>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One live local subscription, owned by a sync session.
pub struct LocalSubHandle {
    stream: Arc<LocalStream>,
    sub_id: u64,
}

impl LocalSubHandle {
    pub fn new(stream: Arc<LocalStream>, sub_id: u64) -> Self {
        Self { stream, sub_id }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.stream_id()
    }

    pub fn unsubscribe(self) {
        self.stream.unsubscribe(self.sub_id);
    }
}

impl std::fmt::Debug for LocalSubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSubHandle")
            .field("stream_id", &self.stream.stream_id())
            .field("sub_id", &self.sub_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingReceiver {
        updates: Mutex<Vec<StreamAndCookie>>,
        downs: Mutex<Vec<StreamId>>,
    }

    impl SyncReceiver for RecordingReceiver {
        fn on_update(&self, update: StreamAndCookie) {
            self.updates.lock().unwrap().push(update);
        }
        fn on_stream_down(&self, stream_id: StreamId) {
            self.downs.lock().unwrap().push(stream_id);
        }
        fn on_sync_error(&self, _err: SyncError) {}
        fn on_close(&self) {}
    }

    fn update(n: i64) -> StreamAndCookie {
        StreamAndCookie {
            events: vec![],
            miniblocks: vec![],
            next_sync_cookie: Some(runnel_proto::v1::SyncCookie {
                node_address: vec![0; 20],
                stream_id: vec![0; 32],
                miniblock_num: n,
                minipool_slot: 0,
            }),
        }
    }

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let stream = LocalStream::new(StreamId([1; 32]));
        let a = Arc::new(RecordingReceiver::default());
        let b = Arc::new(RecordingReceiver::default());
        stream.subscribe(a.clone(), None);
        stream.subscribe(b.clone(), None);

        stream.notify(&update(1));
        assert_eq!(a.updates.lock().unwrap().len(), 1);
        assert_eq!(b.updates.lock().unwrap().len(), 1);
    }

    #[test]
    fn backfill_is_delivered_before_live_updates() {
        let stream = LocalStream::new(StreamId([1; 32]));
        let rx = Arc::new(RecordingReceiver::default());
        stream.subscribe(rx.clone(), Some(update(7)));
        stream.notify(&update(8));

        let seen = rx.updates.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].next_sync_cookie.as_ref().unwrap().miniblock_num, 7);
        assert_eq!(seen[1].next_sync_cookie.as_ref().unwrap().miniblock_num, 8);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let stream = Arc::new(LocalStream::new(StreamId([1; 32])));
        let rx = Arc::new(RecordingReceiver::default());
        let id = stream.subscribe(rx.clone(), None);
        LocalSubHandle::new(stream.clone(), id).unsubscribe();

        stream.notify(&update(1));
        assert!(rx.updates.lock().unwrap().is_empty());
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn close_reports_down_and_drains() {
        let stream = LocalStream::new(StreamId([3; 32]));
        let rx = Arc::new(RecordingReceiver::default());
        stream.subscribe(rx.clone(), None);
        stream.close();

        assert_eq!(rx.downs.lock().unwrap().as_slice(), &[StreamId([3; 32])]);
        assert_eq!(stream.subscriber_count(), 0);
    }
}
