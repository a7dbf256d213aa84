//! Replica-facing write service.
//!
//! These handlers apply writes issued by a peer's quorum pool to the
//! local replica and fan the result out to any sync sessions subscribed
//! here. They never forward: the issuing node already talks to every
//! replica itself.

use crate::error::{auth_status, cache_status, storage_status};
use crate::service::{parse_stream_id, ServiceCore};
use runnel_model::{EventRecord, MiniblockRecord};
use runnel_proto::v1::node_to_node_server::NodeToNode;
use runnel_proto::v1::{
    AllocateStreamRequest, AllocateStreamResponse, NewEventReceivedRequest,
    NewEventReceivedResponse, SaveMiniblockCandidateRequest, SaveMiniblockCandidateResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub(crate) struct NodeToNodeImpl {
    core: Arc<ServiceCore>,
}

impl NodeToNodeImpl {
    pub(crate) fn new(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl NodeToNode for NodeToNodeImpl {
    async fn allocate_stream(
        &self,
        request: Request<AllocateStreamRequest>,
    ) -> Result<Response<AllocateStreamResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let genesis = message
            .genesis
            .ok_or_else(|| Status::invalid_argument("missing genesis miniblock"))?;

        tracing::debug!(stream = %stream_id, "allocating replica");
        self.core
            .storage()
            .create_stream(stream_id, MiniblockRecord::from(genesis))
            .await
            .map_err(storage_status)?;

        let cookie = self
            .core
            .cache()
            .make_cookie(stream_id)
            .await
            .map_err(cache_status)?;
        Ok(Response::new(AllocateStreamResponse {
            sync_cookie: Some(cookie),
        }))
    }

    async fn new_event_received(
        &self,
        request: Request<NewEventReceivedRequest>,
    ) -> Result<Response<NewEventReceivedResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let event = EventRecord::from(
            message
                .event
                .ok_or_else(|| Status::invalid_argument("missing event"))?,
        );

        self.core
            .auth()
            .check_event(stream_id, &event)
            .await
            .map_err(auth_status)?;
        self.core
            .storage()
            .append_event(stream_id, event.clone())
            .await
            .map_err(storage_status)?;

        let record = self
            .core
            .cache()
            .get_stream(stream_id)
            .await
            .map_err(cache_status)?;
        self.core.notify_event(&record, event).await?;
        Ok(Response::new(NewEventReceivedResponse {}))
    }

    async fn save_miniblock_candidate(
        &self,
        request: Request<SaveMiniblockCandidateRequest>,
    ) -> Result<Response<SaveMiniblockCandidateResponse>, Status> {
        let message = request.into_inner();
        let stream_id = parse_stream_id(&message.stream_id)?;
        let miniblock = MiniblockRecord::from(
            message
                .miniblock
                .ok_or_else(|| Status::invalid_argument("missing miniblock"))?,
        );
        let covered = miniblock.events.len();

        self.core
            .storage()
            .seal_miniblock(stream_id, miniblock.clone(), covered)
            .await
            .map_err(storage_status)?;
        tracing::debug!(stream = %stream_id, num = miniblock.num, "saved miniblock candidate");

        let record = self
            .core
            .cache()
            .get_stream(stream_id)
            .await
            .map_err(cache_status)?;
        self.core.notify_miniblock(&record, miniblock).await?;
        Ok(Response::new(SaveMiniblockCandidateResponse {}))
    }
}
