//! One multiplexed sync session.
//!
//! The session owns two bounded queues: data updates and control
//! messages (close, pong, stream-down). Producers are the local
//! subscription bridge and the remote syncers; the only consumer is the
//! dispatch loop, which serializes sends to the client. A full data
//! queue is fatal to the session; a full control queue drops the
//! message and reports failure to whoever queued it.

use crate::config::NetworkConfig;
use crate::sync::remote::RemoteSyncer;
use runnel_model::{NodeAddress, StreamId};
use runnel_node::{LocalSubHandle, SyncError, SyncReceiver};
use runnel_proto::v1::{StreamAndCookie, SyncOp, SyncStreamsResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub(crate) enum SyncControl {
    Close,
    Pong { nonce: String },
    Down { stream_id: StreamId },
}

pub(crate) struct SessionQueues {
    data_rx: mpsc::Receiver<StreamAndCookie>,
    control_rx: mpsc::Receiver<SyncControl>,
}

/// Outcome of detaching one stream from the session.
pub(crate) enum RemovedStream {
    Local(LocalSubHandle),
    Remote {
        syncer: Arc<RemoteSyncer>,
        now_empty: bool,
    },
    NotTracked,
}

#[derive(Default)]
struct SessionState {
    first_error: Option<SyncError>,
    local: HashMap<StreamId, LocalSubHandle>,
    remote_owner: HashMap<StreamId, NodeAddress>,
    remotes: HashMap<NodeAddress, Arc<RemoteSyncer>>,
}

pub struct SyncSession {
    sync_id: String,
    cancel: CancellationToken,
    data_tx: mpsc::Sender<StreamAndCookie>,
    control_tx: mpsc::Sender<SyncControl>,
    state: Mutex<SessionState>,
}

impl SyncSession {
    pub(crate) fn new(sync_id: String, config: &NetworkConfig) -> (Arc<Self>, SessionQueues) {
        let (data_tx, data_rx) = mpsc::channel(config.data_queue_size);
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_size);
        let session = Arc::new(Self {
            sync_id,
            cancel: CancellationToken::new(),
            data_tx,
            control_tx,
            state: Mutex::new(SessionState::default()),
        });
        (
            session,
            SessionQueues {
                data_rx,
                control_rx,
            },
        )
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn first_error(&self) -> Option<SyncError> {
        self.lock().first_error.clone()
    }

    fn set_error_and_cancel(&self, err: SyncError) {
        {
            let mut state = self.lock();
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }
        }
        self.cancel.cancel();
    }

    /// Queue the terminal close notice. Returns false when the control
    /// queue is saturated.
    pub(crate) fn queue_close(&self) -> bool {
        self.control_tx.try_send(SyncControl::Close).is_ok()
    }

    /// Queue a pong reply. Returns false when the control queue is
    /// saturated; the ping request reports that to its caller.
    pub(crate) fn queue_pong(&self, nonce: String) -> bool {
        self.control_tx.try_send(SyncControl::Pong { nonce }).is_ok()
    }

    // ---- stream tracking -------------------------------------------------

    /// Whether the stream is already part of this session, local or
    /// remote. Makes duplicate adds a no-op.
    pub(crate) fn is_tracked(&self, stream_id: StreamId) -> bool {
        let state = self.lock();
        state.local.contains_key(&stream_id) || state.remote_owner.contains_key(&stream_id)
    }

    /// Track a local subscription. Gives the handle back when the
    /// stream is already tracked, or the session is already shutting
    /// down, so the caller can release it.
    pub(crate) fn track_local(&self, handle: LocalSubHandle) -> Result<(), LocalSubHandle> {
        if self.cancel.is_cancelled() {
            return Err(handle);
        }
        let mut state = self.lock();
        let stream_id = handle.stream_id();
        if state.local.contains_key(&stream_id) || state.remote_owner.contains_key(&stream_id) {
            return Err(handle);
        }
        state.local.insert(stream_id, handle);
        Ok(())
    }

    pub(crate) fn track_remote(&self, stream_id: StreamId, address: NodeAddress) {
        let mut state = self.lock();
        if state.local.contains_key(&stream_id) {
            return;
        }
        state.remote_owner.insert(stream_id, address);
    }

    pub(crate) fn remote_for(&self, address: NodeAddress) -> Option<Arc<RemoteSyncer>> {
        self.lock().remotes.get(&address).cloned()
    }

    /// Insert a syncer for its address, keeping an existing one if a
    /// concurrent add won the race. Returns the syncer to use.
    pub(crate) fn insert_remote_syncer(&self, syncer: Arc<RemoteSyncer>) -> Arc<RemoteSyncer> {
        self.lock()
            .remotes
            .entry(syncer.address())
            .or_insert(syncer)
            .clone()
    }

    /// Detach one stream. When the last stream of a remote syncer goes,
    /// the syncer is dropped from the proxy map and handed back for
    /// closing.
    pub(crate) fn remove_stream(&self, stream_id: StreamId) -> RemovedStream {
        let mut state = self.lock();
        if let Some(handle) = state.local.remove(&stream_id) {
            return RemovedStream::Local(handle);
        }
        if let Some(address) = state.remote_owner.remove(&stream_id) {
            if let Some(syncer) = state.remotes.get(&address).cloned() {
                let now_empty = !state.remote_owner.values().any(|a| *a == address);
                if now_empty {
                    state.remotes.remove(&address);
                }
                return RemovedStream::Remote { syncer, now_empty };
            }
        }
        RemovedStream::NotTracked
    }

    /// Drain everything for teardown.
    pub(crate) fn take_all(&self) -> (Vec<LocalSubHandle>, Vec<Arc<RemoteSyncer>>) {
        let mut state = self.lock();
        state.remote_owner.clear();
        let locals = state.local.drain().map(|(_, h)| h).collect();
        let remotes = state.remotes.drain().map(|(_, s)| s).collect();
        (locals, remotes)
    }

    // ---- dispatch --------------------------------------------------------

    /// Consume the session's queues, serializing all sends to the
    /// client. Runs until cancellation, a close control message, or a
    /// downstream send failure.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        mut queues: SessionQueues,
        out: &mpsc::Sender<Result<SyncStreamsResponse, Status>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    {
                        let mut state = self.lock();
                        if state.first_error.is_none() {
                            state.first_error = Some(SyncError::Cancelled);
                        }
                    }
                    // Best-effort terminal notice; the transport may
                    // already be gone.
                    let _ = out.try_send(Ok(self.response(SyncOp::Close)));
                    tracing::debug!(sync_id = %self.sync_id, "sync session cancelled");
                    return;
                }
                Some(update) = queues.data_rx.recv() => {
                    let mut resp = self.response(SyncOp::Update);
                    resp.stream = Some(update);
                    if out.send(Ok(resp)).await.is_err() {
                        self.set_error_and_cancel(SyncError::Transport(
                            "client receive stream closed".into(),
                        ));
                        return;
                    }
                }
                Some(control) = queues.control_rx.recv() => match control {
                    SyncControl::Close => {
                        if let Err(err) = out.send(Ok(self.response(SyncOp::Close))).await {
                            tracing::warn!(sync_id = %self.sync_id, error = %err, "failed to send close notice");
                        }
                        self.cancel.cancel();
                        return;
                    }
                    SyncControl::Pong { nonce } => {
                        let mut resp = self.response(SyncOp::Pong);
                        resp.pong_nonce = nonce;
                        if out.send(Ok(resp)).await.is_err() {
                            self.set_error_and_cancel(SyncError::Transport(
                                "client receive stream closed".into(),
                            ));
                            return;
                        }
                    }
                    SyncControl::Down { stream_id } => {
                        let mut resp = self.response(SyncOp::Down);
                        resp.stream_id = stream_id.as_bytes().to_vec();
                        if out.send(Ok(resp)).await.is_err() {
                            self.set_error_and_cancel(SyncError::Transport(
                                "client receive stream closed".into(),
                            ));
                            return;
                        }
                    }
                },
            }
        }
    }

    pub(crate) fn response(&self, op: SyncOp) -> SyncStreamsResponse {
        SyncStreamsResponse {
            sync_id: self.sync_id.clone(),
            sync_op: op as i32,
            ..Default::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SyncReceiver for SyncSession {
    fn on_update(&self, update: StreamAndCookie) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(update)) = self.data_tx.try_send(update) {
            // The consumer is too slow for this burst; buffering more
            // would only defer the failure.
            let stream_id = update
                .next_sync_cookie
                .as_ref()
                .and_then(|c| c.stream_id().ok())
                .unwrap_or(StreamId([0; 32]));
            tracing::warn!(sync_id = %self.sync_id, stream = %stream_id, "data queue full, cancelling sync");
            self.set_error_and_cancel(SyncError::QueueFull(stream_id));
        }
    }

    fn on_stream_down(&self, stream_id: StreamId) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self
            .control_tx
            .try_send(SyncControl::Down { stream_id })
            .is_err()
        {
            tracing::info!(sync_id = %self.sync_id, stream = %stream_id, "control queue full, dropping down notice");
        }
    }

    fn on_sync_error(&self, err: SyncError) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(sync_id = %self.sync_id, error = %err, "sync error, cancelling session");
        self.set_error_and_cancel(err);
    }

    fn on_close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.queue_close() {
            tracing::info!(sync_id = %self.sync_id, "control queue full, dropping close");
        }
    }
}
