//! Static placement and pass-through admissibility.
//!
//! Deterministic stand-ins for the on-chain registries: every node
//! configured with the same node list computes the same replica set for
//! a given stream id, so placement agrees across the fleet without any
//! coordination. Used by the dev daemon and the test suites.

use async_trait::async_trait;
use runnel_model::{
    AuthError, ChainAuth, EventRecord, NodeAddress, PlacementError, StreamId, StreamPlacement,
};

/// Fixed node list; replicas are chosen by rotating through the sorted
/// list starting at an offset derived from the stream id.
pub struct StaticPlacement {
    nodes: Vec<NodeAddress>,
    replication: usize,
}

impl StaticPlacement {
    pub fn new(mut nodes: Vec<NodeAddress>, replication: usize) -> Self {
        nodes.sort();
        nodes.dedup();
        Self { nodes, replication }
    }

    fn pick(&self, stream_id: StreamId) -> Result<Vec<NodeAddress>, PlacementError> {
        if self.nodes.is_empty() {
            return Err(PlacementError::NoNodes);
        }
        let count = self.replication.clamp(1, self.nodes.len());
        let start = stream_id.as_bytes()[0] as usize % self.nodes.len();
        Ok((0..count)
            .map(|i| self.nodes[(start + i) % self.nodes.len()])
            .collect())
    }
}

#[async_trait]
impl StreamPlacement for StaticPlacement {
    async fn allocate_stream(
        &self,
        stream_id: StreamId,
    ) -> Result<Vec<NodeAddress>, PlacementError> {
        self.pick(stream_id)
    }

    async fn stream_nodes(&self, stream_id: StreamId) -> Result<Vec<NodeAddress>, PlacementError> {
        self.pick(stream_id)
    }
}

/// Admits every event. The production rule engine is external.
#[derive(Default)]
pub struct OpenAuth;

#[async_trait]
impl ChainAuth for OpenAuth {
    async fn check_event(
        &self,
        _stream_id: StreamId,
        _event: &EventRecord,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}
