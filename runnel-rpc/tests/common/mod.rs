//! Shared cluster builder for integration tests.
//!
//! Spins real in-process gRPC servers on loopback TCP. Listeners are
//! bound before any server task starts so registries can be seeded with
//! final endpoints and early client connects just queue in the backlog.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use runnel_model::NodeAddress;
use runnel_node::{MemStorage, OpenAuth, StaticPlacement, StreamCache};
use runnel_proto::v1::stream_service_client::StreamServiceClient;
use runnel_proto::v1::{Envelope, StreamAndCookie, SyncCookie, SyncStreamsResponse};
use runnel_rpc::{NetworkConfig, NodeRegistry, RpcServer, ServiceCore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;

pub const SEAL_SIZE: usize = 4;

pub struct TestNode {
    pub address: NodeAddress,
    pub rpc_addr: SocketAddr,
    pub core: Arc<ServiceCore>,
    pub storage: Arc<MemStorage>,
    shutdown: CancellationToken,
}

impl TestNode {
    pub async fn client(&self) -> StreamServiceClient<Channel> {
        connect(self.rpc_addr).await
    }

    /// Stop this node's server, as if the machine went away.
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

/// Node addresses are 1..=count, so with `StaticPlacement` a stream id
/// whose first byte is `b` is replicated on `replication` nodes
/// starting at index `b % count` of the sorted address list.
pub async fn start_cluster(count: u8, replication: usize) -> TestCluster {
    let addresses: Vec<NodeAddress> = (1..=count).map(|b| NodeAddress([b; 20])).collect();

    let mut listeners = Vec::new();
    let mut endpoints = Vec::new();
    for address in &addresses {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        endpoints.push((*address, format!("http://127.0.0.1:{port}")));
        listeners.push(listener);
    }

    let placement = Arc::new(StaticPlacement::new(addresses.clone(), replication));
    let mut nodes = Vec::new();
    for (address, listener) in addresses.iter().zip(listeners) {
        let config = NetworkConfig {
            minipool_seal_size: SEAL_SIZE,
            node_request_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        };
        let peers: Vec<(NodeAddress, String)> = endpoints
            .iter()
            .filter(|(a, _)| a != address)
            .cloned()
            .collect();
        let storage = Arc::new(MemStorage::new());
        let registry = Arc::new(NodeRegistry::new(*address, config.clone(), peers));
        let cache = Arc::new(StreamCache::new(*address, storage.clone(), placement.clone()));
        let core = ServiceCore::new(
            cache,
            registry,
            placement.clone(),
            Arc::new(OpenAuth),
            config,
        );

        let rpc_addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let server = RpcServer::new(core.clone(), listener);
        let signal = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.serve_with_shutdown(signal.cancelled()).await;
        });

        nodes.push(TestNode {
            address: *address,
            rpc_addr,
            core,
            storage,
            shutdown,
        });
    }

    TestCluster { nodes }
}

pub async fn connect(addr: SocketAddr) -> StreamServiceClient<Channel> {
    StreamServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("connect")
}

pub fn stream_id(first_byte: u8) -> runnel_model::StreamId {
    let mut bytes = [9u8; 32];
    bytes[0] = first_byte;
    runnel_model::StreamId(bytes)
}

pub fn event(n: u8) -> Envelope {
    Envelope {
        hash: vec![n; 32],
        payload: format!("event-{n}").into_bytes(),
    }
}

pub fn cookie_for(owner: NodeAddress, id: runnel_model::StreamId) -> SyncCookie {
    SyncCookie {
        node_address: owner.as_bytes().to_vec(),
        stream_id: id.as_bytes().to_vec(),
        miniblock_num: 0,
        minipool_slot: 0,
    }
}

/// Next response off a sync stream, bounded so a hung session fails the
/// test instead of wedging it.
pub async fn next_response(stream: &mut Streaming<SyncStreamsResponse>) -> SyncStreamsResponse {
    tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("timed out waiting for sync response")
        .expect("sync stream errored")
        .expect("sync stream ended unexpectedly")
}

/// Total events visible in an update, pooled or inside miniblocks.
pub fn update_event_count(update: &StreamAndCookie) -> usize {
    update.events.len()
        + update
            .miniblocks
            .iter()
            .map(|mb| mb.events.len())
            .sum::<usize>()
}
