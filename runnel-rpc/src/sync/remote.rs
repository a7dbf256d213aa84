//! Remote half of a multiplexed session.
//!
//! One `RemoteSyncer` owns at most one outstanding `SyncStreams` call
//! to one peer node, on behalf of one session. The first reply must be
//! the peer's SYNC_NEW acknowledgement; afterwards every update is
//! relayed into the owning session. Streams can be added to and removed
//! from the open call incrementally using the peer's own sync id. Any
//! failure talking to the peer escalates to a session-level error.

use runnel_model::{NodeAddress, StreamId};
use runnel_node::{SyncError, SyncReceiver};
use runnel_proto::v1::stream_service_client::StreamServiceClient;
use runnel_proto::v1::{
    AddStreamToSyncRequest, RemoveStreamFromSyncRequest, SyncCookie, SyncOp, SyncStreamsRequest,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::sync::session::SyncSession;

#[derive(Default)]
struct Flags {
    started: bool,
    closed: bool,
}

pub struct RemoteSyncer {
    address: NodeAddress,
    client: StreamServiceClient<Channel>,
    cancel: CancellationToken,
    sync_id_tx: watch::Sender<String>,
    flags: Mutex<Flags>,
}

impl RemoteSyncer {
    /// `session_cancel` is the owning session's token; the syncer gets
    /// a child so closing it never tears the session down by itself.
    pub fn new(
        address: NodeAddress,
        client: StreamServiceClient<Channel>,
        session_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (sync_id_tx, _) = watch::channel(String::new());
        Arc::new(Self {
            address,
            client,
            cancel: session_cancel.child_token(),
            sync_id_tx,
            flags: Mutex::new(Flags::default()),
        })
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Open the remote call and spawn the relay task. A second start on
    /// an already-started or closed syncer is a no-op.
    pub fn start(self: &Arc<Self>, cookies: Vec<SyncCookie>, session: Arc<SyncSession>) {
        {
            let mut flags = self.lock();
            if flags.started || flags.closed {
                return;
            }
            flags.started = true;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.relay(cookies, &session).await;
            this.close();
            if let Err(err) = result {
                tracing::info!(peer = %this.address, error = %err, "remote sync failed");
                session.on_sync_error(err);
            }
        });
    }

    /// Send an incremental add over the open remote call. A no-op when
    /// the call was never started or is already closed.
    pub async fn add_stream(&self, cookie: SyncCookie) -> Result<(), SyncError> {
        let Some(remote_sync_id) = self.remote_sync_id().await else {
            return Ok(());
        };
        let mut client = self.client.clone();
        client
            .add_stream_to_sync(AddStreamToSyncRequest {
                sync_id: remote_sync_id,
                sync_pos: Some(cookie),
            })
            .await
            .map(|_| ())
            .map_err(|status| SyncError::Transport(format!("remote add failed: {status}")))
    }

    /// Send an incremental remove over the open remote call.
    pub async fn remove_stream(&self, stream_id: StreamId) -> Result<(), SyncError> {
        let Some(remote_sync_id) = self.remote_sync_id().await else {
            return Ok(());
        };
        let mut client = self.client.clone();
        client
            .remove_stream_from_sync(RemoveStreamFromSyncRequest {
                sync_id: remote_sync_id,
                stream_id: stream_id.as_bytes().to_vec(),
            })
            .await
            .map(|_| ())
            .map_err(|status| SyncError::Transport(format!("remote remove failed: {status}")))
    }

    /// Stop relaying. Idempotent; a closed syncer is never reused.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cancel.cancel();
    }

    /// The peer's sync id, waiting out the handshake if the call was
    /// just opened. `None` when the syncer never started or is closed.
    async fn remote_sync_id(&self) -> Option<String> {
        {
            let flags = self.lock();
            if !flags.started || flags.closed {
                return None;
            }
        }
        let mut rx = self.sync_id_tx.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            id = rx.wait_for(|id| !id.is_empty()) => id.ok().map(|id| id.as_str().to_owned()),
        }
    }

    async fn relay(&self, cookies: Vec<SyncCookie>, session: &Arc<SyncSession>) -> Result<(), SyncError> {
        let mut client = self.client.clone();
        let request = SyncStreamsRequest { sync_pos: cookies };

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            r = client.sync_streams(request) => r.map_err(|status| {
                SyncError::Transport(format!("remote sync open failed: {status}"))
            })?,
        };
        let mut stream = response.into_inner();

        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            m = stream.message() => m.map_err(|status| SyncError::Transport(status.to_string()))?,
        };
        let Some(first) = first else {
            return Err(SyncError::Protocol(
                "remote sync closed before handshake".into(),
            ));
        };
        if first.sync_op != SyncOp::New as i32 || first.sync_id.is_empty() {
            return Err(SyncError::Protocol(
                "first sync response must be SYNC_NEW with a sync id".into(),
            ));
        }
        let _ = self.sync_id_tx.send(first.sync_id);

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                m = stream.message() => m,
            };
            match message {
                Ok(Some(resp)) => match SyncOp::try_from(resp.sync_op) {
                    Ok(SyncOp::Update) => {
                        if let Some(update) = resp.stream {
                            session.on_update(update);
                        }
                    }
                    Ok(SyncOp::Down) => {
                        if let Ok(stream_id) = StreamId::try_from(resp.stream_id.as_slice()) {
                            session.on_stream_down(stream_id);
                        }
                    }
                    Ok(SyncOp::Close) => {
                        return Err(SyncError::Transport("remote closed the sync".into()));
                    }
                    _ => {
                        tracing::debug!(peer = %self.address, op = resp.sync_op, "ignoring sync op");
                    }
                },
                Ok(None) => return Err(SyncError::Transport("remote sync ended".into())),
                Err(status) => return Err(SyncError::Transport(status.to_string())),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }
}
