//! Session table and sync entry points.
//!
//! Owns the process-wide `sync_id → session` table. The table lock only
//! guards insert/lookup/delete; each session guards its own maps, so
//! add/remove traffic on unrelated sessions never serializes here.

use crate::config::NetworkConfig;
use crate::error::{cache_status, registry_status, sync_status};
use crate::registry::NodeRegistry;
use crate::sync::remote::RemoteSyncer;
use crate::sync::session::{RemovedStream, SessionQueues, SyncSession};
use runnel_model::{NodeAddress, StreamId};
use runnel_node::{StreamCache, SyncError, SyncReceiver};
use runnel_proto::v1::{SyncCookie, SyncOp, SyncStreamsResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tonic::Status;
use uuid::Uuid;

pub struct SyncHandler {
    cache: Arc<StreamCache>,
    registry: Arc<NodeRegistry>,
    config: NetworkConfig,
    sessions: Mutex<HashMap<String, Arc<SyncSession>>>,
}

impl SyncHandler {
    pub fn new(cache: Arc<StreamCache>, registry: Arc<NodeRegistry>, config: NetworkConfig) -> Self {
        Self {
            cache,
            registry,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Open a session: register it, acknowledge with SYNC_NEW, then run
    /// subscription setup and the dispatch loop in a background task.
    /// The returned session is handed back so the transport layer can
    /// tie its lifetime to the response stream.
    pub async fn sync_streams(
        self: &Arc<Self>,
        sync_pos: Vec<SyncCookie>,
        out: mpsc::Sender<Result<SyncStreamsResponse, Status>>,
    ) -> Result<Arc<SyncSession>, Status> {
        let sync_id = Uuid::new_v4().simple().to_string();
        let (session, queues) = SyncSession::new(sync_id.clone(), &self.config);
        self.lock().insert(sync_id.clone(), session.clone());
        tracing::debug!(sync_id = %sync_id, streams = sync_pos.len(), "sync session opened");

        if out
            .send(Ok(session.response(SyncOp::New)))
            .await
            .is_err()
        {
            self.lock().remove(&sync_id);
            return Err(Status::cancelled("client went away before sync started"));
        }

        let handler = self.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            handler.run_session(task_session, queues, sync_pos, out).await;
        });

        Ok(session)
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<SyncSession>,
        queues: SessionQueues,
        sync_pos: Vec<SyncCookie>,
        out: mpsc::Sender<Result<SyncStreamsResponse, Status>>,
    ) {
        if let Err(err) = self.start_streams(&session, sync_pos).await {
            session.on_sync_error(err);
        }

        session.dispatch(queues, &out).await;

        let (locals, remotes) = session.take_all();
        for handle in locals {
            handle.unsubscribe();
        }
        for syncer in remotes {
            syncer.close();
        }
        self.lock().remove(session.sync_id());
        let first_error = session.first_error();
        tracing::debug!(sync_id = %session.sync_id(), error = ?first_error, "sync session closed");
    }

    /// Classify the requested cookies and start one local subscription
    /// per hosted stream and one remote syncer per distinct peer node.
    async fn start_streams(
        &self,
        session: &Arc<SyncSession>,
        sync_pos: Vec<SyncCookie>,
    ) -> Result<(), SyncError> {
        let local_address = self.registry.local_address();
        let mut remote_groups: HashMap<NodeAddress, Vec<SyncCookie>> = HashMap::new();

        for cookie in sync_pos {
            let address = cookie.node_address().map_err(SyncError::Protocol)?;
            if address == local_address {
                self.subscribe_local(session, &cookie).await?;
            } else {
                remote_groups.entry(address).or_default().push(cookie);
            }
        }

        for (address, cookies) in remote_groups {
            let client = self
                .registry
                .stream_client(address)
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let syncer = session.insert_remote_syncer(RemoteSyncer::new(
                address,
                client,
                session.cancel_token(),
            ));
            for cookie in &cookies {
                if let Ok(stream_id) = cookie.stream_id() {
                    session.track_remote(stream_id, address);
                }
            }
            syncer.start(cookies, session.clone());
        }

        Ok(())
    }

    async fn subscribe_local(
        &self,
        session: &Arc<SyncSession>,
        cookie: &SyncCookie,
    ) -> Result<(), SyncError> {
        let stream_id = cookie.stream_id().map_err(SyncError::Protocol)?;
        if session.is_tracked(stream_id) {
            tracing::debug!(sync_id = %session.sync_id(), stream = %stream_id, "stream already subscribed");
            return Ok(());
        }
        let receiver: Arc<dyn SyncReceiver> = session.clone();
        let handle = self
            .cache
            .subscribe_local(cookie, receiver)
            .await
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        if let Err(handle) = session.track_local(handle) {
            // Lost a race with a concurrent add of the same stream.
            handle.unsubscribe();
        }
        Ok(())
    }

    /// Add one stream to a running session.
    pub async fn add_stream(&self, sync_id: &str, cookie: SyncCookie) -> Result<(), Status> {
        let session = self.get(sync_id)?;
        let stream_id = cookie
            .stream_id()
            .map_err(Status::invalid_argument)?;
        let address = cookie
            .node_address()
            .map_err(Status::invalid_argument)?;

        if session.is_tracked(stream_id) {
            return Ok(());
        }

        if address == self.registry.local_address() {
            let receiver: Arc<dyn SyncReceiver> = session.clone();
            let handle = self
                .cache
                .subscribe_local(&cookie, receiver)
                .await
                .map_err(cache_status)?;
            if let Err(handle) = session.track_local(handle) {
                handle.unsubscribe();
            }
            return Ok(());
        }

        if let Some(syncer) = session.remote_for(address) {
            session.track_remote(stream_id, address);
            if let Err(err) = syncer.add_stream(cookie).await {
                session.on_sync_error(err.clone());
                return Err(sync_status(err));
            }
            return Ok(());
        }

        let client = self.registry.stream_client(address).map_err(registry_status)?;
        let candidate = RemoteSyncer::new(address, client, session.cancel_token());
        let syncer = session.insert_remote_syncer(candidate.clone());
        session.track_remote(stream_id, address);
        if Arc::ptr_eq(&syncer, &candidate) {
            syncer.start(vec![cookie], session.clone());
        } else if let Err(err) = syncer.add_stream(cookie).await {
            // A concurrent add created the syncer first; ride its call.
            session.on_sync_error(err.clone());
            return Err(sync_status(err));
        }
        Ok(())
    }

    /// Remove one stream, pruning a remote syncer left with no streams.
    pub async fn remove_stream(&self, sync_id: &str, stream_id: StreamId) -> Result<(), Status> {
        let session = self.get(sync_id)?;
        match session.remove_stream(stream_id) {
            RemovedStream::Local(handle) => {
                handle.unsubscribe();
                Ok(())
            }
            RemovedStream::Remote { syncer, now_empty } => {
                let result = syncer.remove_stream(stream_id).await;
                if now_empty {
                    tracing::debug!(sync_id = %sync_id, peer = %syncer.address(), "closing idle remote syncer");
                    syncer.close();
                }
                match result {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        session.on_sync_error(err.clone());
                        Err(sync_status(err))
                    }
                }
            }
            RemovedStream::NotTracked => Ok(()),
        }
    }

    /// Queue the terminal close. Idempotent; unknown ids are fine.
    pub fn cancel_sync(&self, sync_id: &str) {
        if let Some(session) = self.lock().get(sync_id).cloned() {
            session.on_close();
        }
    }

    /// Queue a pong carrying the client nonce.
    pub fn ping_sync(&self, sync_id: &str, nonce: String) -> Result<(), Status> {
        let session = self.get(sync_id)?;
        if session.is_cancelled() {
            return Err(Status::cancelled("sync session is shutting down"));
        }
        if !session.queue_pong(nonce) {
            return Err(Status::resource_exhausted("sync control queue full"));
        }
        Ok(())
    }

    fn get(&self, sync_id: &str) -> Result<Arc<SyncSession>, Status> {
        self.lock()
            .get(sync_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("unknown sync id: {sync_id}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SyncSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
