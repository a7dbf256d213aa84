//! Client-facing stream service.
//!
//! Writes against hosted streams are quorum-committed to the local
//! replica and every remote replica; writes against streams hosted
//! elsewhere are relayed to the current sticky peer. Reads are served
//! locally or through the retrying forwarder.

use crate::config::NetworkConfig;
use crate::error::{auth_status, cache_status, placement_status, registry_status, storage_status};
use crate::forwarder::{forward_streaming, forward_unary, StreamBreak};
use crate::quorum::QuorumPool;
use crate::registry::NodeRegistry;
use crate::sync::SyncHandler;
use runnel_model::{ChainAuth, EventRecord, MiniblockRecord, Storage, StreamId, StreamPlacement};
use runnel_node::{StreamCache, StreamRecord};
use runnel_proto::v1::stream_service_server::StreamService;
use runnel_proto::v1::{
    AddEventRequest, AddEventResponse, AddStreamToSyncRequest, AddStreamToSyncResponse,
    AllocateStreamRequest, CancelSyncRequest, CancelSyncResponse, CreateStreamRequest,
    CreateStreamResponse, Envelope, GetMiniblocksRequest, GetMiniblocksResponse,
    GetStreamExRequest, GetStreamExResponse, GetStreamRequest, GetStreamResponse, Miniblock,
    NewEventReceivedRequest, PingSyncRequest, PingSyncResponse, RemoveStreamFromSyncRequest,
    RemoveStreamFromSyncResponse, SaveMiniblockCandidateRequest, StreamAndCookie, SyncCookie,
    SyncStreamsRequest, SyncStreamsResponse,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};

/// Marker on relayed writes: the receiving node must not forward again,
/// even if its placement view disagrees.
pub const NO_FORWARD_HEADER: &str = "x-runnel-no-forward";

/// Shared state of both gRPC services.
pub struct ServiceCore {
    cache: Arc<StreamCache>,
    registry: Arc<NodeRegistry>,
    placement: Arc<dyn StreamPlacement>,
    auth: Arc<dyn ChainAuth>,
    config: NetworkConfig,
    sync: Arc<SyncHandler>,
}

impl ServiceCore {
    pub fn new(
        cache: Arc<StreamCache>,
        registry: Arc<NodeRegistry>,
        placement: Arc<dyn StreamPlacement>,
        auth: Arc<dyn ChainAuth>,
        config: NetworkConfig,
    ) -> Arc<Self> {
        let sync = Arc::new(SyncHandler::new(
            cache.clone(),
            registry.clone(),
            config.clone(),
        ));
        Arc::new(Self {
            cache,
            registry,
            placement,
            auth,
            config,
            sync,
        })
    }

    pub fn cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<SyncHandler> {
        &self.sync
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn auth(&self) -> &Arc<dyn ChainAuth> {
        &self.auth
    }

    pub(crate) fn storage(&self) -> Arc<dyn Storage> {
        self.cache.storage().clone()
    }

    /// Deliver a freshly committed event to this replica's subscribers.
    pub(crate) async fn notify_event(
        &self,
        record: &Arc<StreamRecord>,
        event: EventRecord,
    ) -> Result<(), Status> {
        let cookie = self
            .cache
            .make_cookie(record.stream_id())
            .await
            .map_err(cache_status)?;
        record.local_stream().notify(&StreamAndCookie {
            events: vec![Envelope::from(event)],
            miniblocks: vec![],
            next_sync_cookie: Some(cookie),
        });
        Ok(())
    }

    /// Deliver a freshly sealed miniblock to this replica's subscribers.
    pub(crate) async fn notify_miniblock(
        &self,
        record: &Arc<StreamRecord>,
        miniblock: MiniblockRecord,
    ) -> Result<(), Status> {
        let cookie = self
            .cache
            .make_cookie(record.stream_id())
            .await
            .map_err(cache_status)?;
        record.local_stream().notify(&StreamAndCookie {
            events: vec![],
            miniblocks: vec![Miniblock::from(miniblock)],
            next_sync_cookie: Some(cookie),
        });
        Ok(())
    }

    /// Seal the minipool into a miniblock once it reaches the configured
    /// size, quorum-committing the candidate to all replicas. Runs in
    /// the background; a failure leaves the minipool intact so the next
    /// append retries.
    fn maybe_seal(self: &Arc<Self>, record: Arc<StreamRecord>) {
        let core = self.clone();
        tokio::spawn(async move {
            if let Err(err) = core.seal_minipool(&record).await {
                tracing::warn!(
                    stream = %record.stream_id(),
                    error = %err,
                    "miniblock seal failed, keeping minipool"
                );
            }
        });
    }

    async fn seal_minipool(self: &Arc<Self>, record: &Arc<StreamRecord>) -> Result<(), Status> {
        let stream_id = record.stream_id();
        let storage = self.storage();
        let pending = storage
            .pending_events(stream_id)
            .await
            .map_err(storage_status)?;
        if pending.len() < self.config.minipool_seal_size {
            return Ok(());
        }
        let num = storage
            .last_miniblock_num(stream_id)
            .await
            .map_err(storage_status)?
            + 1;
        let candidate = MiniblockRecord {
            num,
            header_hash: header_hash(&pending),
            events: pending.clone(),
        };

        let remotes = record.nodes.remotes();
        let mut pool = QuorumPool::new(remotes.len());
        {
            let storage = storage.clone();
            let candidate = candidate.clone();
            let covered = pending.len();
            pool.go_local(async move {
                storage
                    .seal_miniblock(stream_id, candidate, covered)
                    .await
                    .map_err(storage_status)
            });
        }
        for node in remotes {
            let client = self.registry.node_client(node).map_err(registry_status)?;
            let request = SaveMiniblockCandidateRequest {
                stream_id: stream_id.as_bytes().to_vec(),
                miniblock: Some(Miniblock::from(candidate.clone())),
            };
            pool.go_remote(node, async move {
                let mut client = client;
                client.save_miniblock_candidate(request).await.map(|_| ())
            });
        }
        pool.wait().await?;
        tracing::debug!(stream = %stream_id, num, "miniblock sealed");

        self.notify_miniblock(record, candidate).await
    }
}

/// Header hash of a miniblock candidate: digest over the batch's event
/// hashes in order.
pub(crate) fn header_hash(events: &[EventRecord]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    for event in events {
        hasher.update(&event.hash);
    }
    hasher.finalize().as_bytes().to_vec()
}

pub(crate) fn parse_stream_id(bytes: &[u8]) -> Result<StreamId, Status> {
    StreamId::try_from(bytes)
        .map_err(|_| Status::invalid_argument(format!("invalid stream id length: {}", bytes.len())))
}

pub(crate) struct StreamServiceImpl {
    core: Arc<ServiceCore>,
}

impl StreamServiceImpl {
    pub(crate) fn new(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }

    async fn local_add_event(
        &self,
        record: Arc<StreamRecord>,
        event: EventRecord,
    ) -> Result<(), Status> {
        let core = &self.core;
        let stream_id = record.stream_id();
        core.auth()
            .check_event(stream_id, &event)
            .await
            .map_err(auth_status)?;

        let remotes = record.nodes.remotes();
        let mut pool = QuorumPool::new(remotes.len());
        {
            let storage = core.storage();
            let event = event.clone();
            pool.go_local(async move {
                storage
                    .append_event(stream_id, event)
                    .await
                    .map(|_slot| ())
                    .map_err(storage_status)
            });
        }
        for node in remotes {
            let client = core.registry.node_client(node).map_err(registry_status)?;
            let request = NewEventReceivedRequest {
                stream_id: stream_id.as_bytes().to_vec(),
                event: Some(Envelope::from(event.clone())),
            };
            pool.go_remote(node, async move {
                let mut client = client;
                client.new_event_received(request).await.map(|_| ())
            });
        }
        pool.wait().await?;

        core.notify_event(&record, event).await?;
        core.maybe_seal(record);
        Ok(())
    }

    async fn local_get_stream(&self, stream_id: StreamId) -> Result<StreamAndCookie, Status> {
        let storage = self.core.storage();
        let miniblocks = storage
            .read_miniblocks(stream_id, 0, -1)
            .await
            .map_err(storage_status)?;
        let pending = storage
            .pending_events(stream_id)
            .await
            .map_err(storage_status)?;
        let cookie = self
            .core
            .cache
            .make_cookie(stream_id)
            .await
            .map_err(cache_status)?;
        Ok(StreamAndCookie {
            events: pending.into_iter().map(Envelope::from).collect(),
            miniblocks: miniblocks.into_iter().map(Miniblock::from).collect(),
            next_sync_cookie: Some(cookie),
        })
    }

    async fn relay_get_stream_ex(
        &self,
        record: Arc<StreamRecord>,
        message: GetStreamExRequest,
        out: mpsc::Sender<Result<GetStreamExResponse, Status>>,
    ) -> Result<(), Status> {
        let core = self.core.clone();
        forward_streaming(&record.nodes, &self.core.config, 0, move |peer| {
            let core = core.clone();
            let out = out.clone();
            let message = message.clone();
            async move {
                let mut has_streamed = false;
                let mut client = core
                    .registry
                    .stream_client(peer)
                    .map_err(|e| StreamBreak::before_data(registry_status(e)))?;
                let mut stream = client
                    .get_stream_ex(message)
                    .await
                    .map_err(StreamBreak::before_data)?
                    .into_inner();

                let mut saw_last_packet = false;
                loop {
                    match stream.message().await {
                        Ok(Some(packet)) => {
                            if packet.data.is_none() {
                                saw_last_packet = true;
                            }
                            if out.send(Ok(packet)).await.is_err() {
                                return Err(StreamBreak::mid_stream(Status::cancelled(
                                    "client went away",
                                )));
                            }
                            has_streamed = true;
                        }
                        Ok(None) => break,
                        Err(status) => {
                            return Err(StreamBreak {
                                has_streamed,
                                status,
                            })
                        }
                    }
                }
                // A stream that ends without the empty terminator means
                // the peer died mid-response.
                if !saw_last_packet {
                    return Err(StreamBreak {
                        has_streamed,
                        status: Status::unavailable("peer did not send all packets"),
                    });
                }
                Ok(())
            }
        })
        .await
    }
}

#[tonic::async_trait]
impl StreamService for StreamServiceImpl {
    async fn create_stream(
        &self,
        request: Request<CreateStreamRequest>,
    ) -> Result<Response<CreateStreamResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        if message.events.is_empty() {
            return Err(Status::invalid_argument(
                "genesis requires at least one event",
            ));
        }
        let events: Vec<EventRecord> =
            message.events.into_iter().map(EventRecord::from).collect();
        let genesis = MiniblockRecord {
            num: 0,
            header_hash: header_hash(&events),
            events,
        };

        let core = &self.core;
        let nodes = core
            .placement
            .allocate_stream(stream_id)
            .await
            .map_err(placement_status)?;
        tracing::debug!(stream = %stream_id, replicas = nodes.len(), "creating stream");
        let record = core.cache.register_stream(stream_id, nodes);

        let remotes = record.nodes.remotes();
        let mut pool = QuorumPool::new(remotes.len());
        if record.nodes.is_local() {
            let storage = core.storage();
            let genesis = genesis.clone();
            pool.go_local(async move {
                storage
                    .create_stream(stream_id, genesis)
                    .await
                    .map_err(storage_status)
            });
        }
        for node in remotes {
            let client = core.registry.node_client(node).map_err(registry_status)?;
            let request = AllocateStreamRequest {
                stream_id: stream_id.as_bytes().to_vec(),
                genesis: Some(Miniblock::from(genesis.clone())),
            };
            pool.go_remote(node, async move {
                let mut client = client;
                client.allocate_stream(request).await.map(|_| ())
            });
        }
        pool.wait().await?;

        let cookie = if record.nodes.is_local() {
            core.cache
                .make_cookie(stream_id)
                .await
                .map_err(cache_status)?
        } else {
            let owner = record
                .nodes
                .sticky_peer()
                .ok_or_else(|| Status::internal("stream has no replicas"))?;
            SyncCookie {
                node_address: owner.as_bytes().to_vec(),
                stream_id: stream_id.as_bytes().to_vec(),
                miniblock_num: 1,
                minipool_slot: 0,
            }
        };

        Ok(Response::new(CreateStreamResponse {
            stream: Some(StreamAndCookie {
                events: vec![],
                miniblocks: vec![Miniblock::from(genesis)],
                next_sync_cookie: Some(cookie),
            }),
        }))
    }

    async fn get_stream(
        &self,
        request: Request<GetStreamRequest>,
    ) -> Result<Response<GetStreamResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;

        let record = match self.core.cache.get_stream(stream_id).await {
            Ok(record) => record,
            Err(err) => {
                let status = cache_status(err);
                if message.optional && status.code() == tonic::Code::NotFound {
                    return Ok(Response::new(GetStreamResponse { stream: None }));
                }
                return Err(status);
            }
        };

        if record.nodes.is_local() {
            return match self.local_get_stream(stream_id).await {
                Ok(stream) => Ok(Response::new(GetStreamResponse {
                    stream: Some(stream),
                })),
                Err(status)
                    if message.optional && status.code() == tonic::Code::NotFound =>
                {
                    Ok(Response::new(GetStreamResponse { stream: None }))
                }
                Err(status) => Err(status),
            };
        }

        let core = self.core.clone();
        forward_unary(&record.nodes, &self.core.config, 0, move |peer| {
            let core = core.clone();
            let message = message.clone();
            async move {
                let mut client = core.registry.stream_client(peer).map_err(registry_status)?;
                Ok(client.get_stream(message).await?.into_inner())
            }
        })
        .await
        .map(Response::new)
    }

    async fn get_miniblocks(
        &self,
        request: Request<GetMiniblocksRequest>,
    ) -> Result<Response<GetMiniblocksResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let record = self
            .core
            .cache
            .get_stream(stream_id)
            .await
            .map_err(cache_status)?;

        if record.nodes.is_local() {
            let miniblocks = self
                .core
                .storage()
                .read_miniblocks(stream_id, message.from_inclusive, message.to_exclusive)
                .await
                .map_err(storage_status)?;
            return Ok(Response::new(GetMiniblocksResponse {
                miniblocks: miniblocks.into_iter().map(Miniblock::from).collect(),
            }));
        }

        let core = self.core.clone();
        forward_unary(&record.nodes, &self.core.config, 0, move |peer| {
            let core = core.clone();
            let message = message.clone();
            async move {
                let mut client = core.registry.stream_client(peer).map_err(registry_status)?;
                Ok(client.get_miniblocks(message).await?.into_inner())
            }
        })
        .await
        .map(Response::new)
    }

    type GetStreamExStream = ReceiverStream<Result<GetStreamExResponse, Status>>;

    async fn get_stream_ex(
        &self,
        request: Request<GetStreamExRequest>,
    ) -> Result<Response<Self::GetStreamExStream>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let record = self
            .core
            .cache
            .get_stream(stream_id)
            .await
            .map_err(cache_status)?;

        let (tx, rx) = mpsc::channel(16);
        let service = StreamServiceImpl {
            core: self.core.clone(),
        };
        tokio::spawn(async move {
            let result = if record.nodes.is_local() {
                local_get_stream_ex(&service.core, stream_id, &tx).await
            } else {
                service.relay_get_stream_ex(record, message, tx.clone()).await
            };
            if let Err(status) = result {
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn add_event(
        &self,
        request: Request<AddEventRequest>,
    ) -> Result<Response<AddEventResponse>, Status> {
        let no_forward = request.metadata().contains_key(NO_FORWARD_HEADER);
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let event = message
            .event
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing event"))?;

        let record = self
            .core
            .cache
            .get_stream(stream_id)
            .await
            .map_err(cache_status)?;

        if record.nodes.is_local() {
            self.local_add_event(record, EventRecord::from(event)).await?;
            return Ok(Response::new(AddEventResponse {}));
        }

        if no_forward {
            return Err(Status::unavailable(
                "forwarding disabled by request header",
            ));
        }

        let peer = record
            .nodes
            .sticky_peer()
            .ok_or_else(|| Status::unavailable("no replica available"))?;
        tracing::debug!(stream = %stream_id, peer = %peer, "forwarding add_event");
        let mut client = self
            .core
            .registry
            .stream_client(peer)
            .map_err(registry_status)?;
        let mut forwarded = Request::new(message);
        forwarded
            .metadata_mut()
            .insert(NO_FORWARD_HEADER, MetadataValue::from_static("true"));
        Ok(Response::new(client.add_event(forwarded).await?.into_inner()))
    }

    type SyncStreamsStream = SessionStream;

    async fn sync_streams(
        &self,
        request: Request<SyncStreamsRequest>,
    ) -> Result<Response<Self::SyncStreamsStream>, Status> {
        let message = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let session = self.core.sync.sync_streams(message.sync_pos, tx).await?;
        // Dropping the response stream (client disconnect included)
        // cancels the session.
        let guard = session.cancel_token().clone().drop_guard();
        Ok(Response::new(SessionStream {
            inner: ReceiverStream::new(rx),
            _guard: guard,
        }))
    }

    async fn add_stream_to_sync(
        &self,
        request: Request<AddStreamToSyncRequest>,
    ) -> Result<Response<AddStreamToSyncResponse>, Status> {
        let message = request.into_inner();
        let cookie = message
            .sync_pos
            .ok_or_else(|| Status::invalid_argument("missing sync position"))?;
        self.core.sync.add_stream(&message.sync_id, cookie).await?;
        Ok(Response::new(AddStreamToSyncResponse {}))
    }

    async fn remove_stream_from_sync(
        &self,
        request: Request<RemoveStreamFromSyncRequest>,
    ) -> Result<Response<RemoveStreamFromSyncResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        self.core
            .sync
            .remove_stream(&message.sync_id, stream_id)
            .await?;
        Ok(Response::new(RemoveStreamFromSyncResponse {}))
    }

    async fn cancel_sync(
        &self,
        request: Request<CancelSyncRequest>,
    ) -> Result<Response<CancelSyncResponse>, Status> {
        self.core.sync.cancel_sync(&request.into_inner().sync_id);
        Ok(Response::new(CancelSyncResponse {}))
    }

    async fn ping_sync(
        &self,
        request: Request<PingSyncRequest>,
    ) -> Result<Response<PingSyncResponse>, Status> {
        let message = request.into_inner();
        self.core.sync.ping_sync(&message.sync_id, message.nonce)?;
        Ok(Response::new(PingSyncResponse {}))
    }
}

/// A sync response stream whose drop tears the session down, so a
/// vanished client cannot leave the session running.
pub struct SessionStream {
    inner: ReceiverStream<Result<SyncStreamsResponse, Status>>,
    _guard: tokio_util::sync::DropGuard,
}

impl futures_util::Stream for SessionStream {
    type Item = Result<SyncStreamsResponse, Status>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn local_get_stream_ex(
    core: &Arc<ServiceCore>,
    stream_id: StreamId,
    out: &mpsc::Sender<Result<GetStreamExResponse, Status>>,
) -> Result<(), Status> {
    let miniblocks = core
        .storage()
        .read_miniblocks(stream_id, 0, -1)
        .await
        .map_err(storage_status)?;
    for miniblock in miniblocks {
        let packet = GetStreamExResponse {
            data: Some(Miniblock::from(miniblock)),
        };
        if out.send(Ok(packet)).await.is_err() {
            return Ok(());
        }
    }
    // Empty terminator so the receiver can tell completion from loss.
    let _ = out.send(Ok(GetStreamExResponse { data: None })).await;
    Ok(())
}
