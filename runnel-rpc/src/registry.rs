//! Peer node registry.
//!
//! Maps node addresses to endpoints and hands out cached, lazily
//! connected tonic clients. Node-to-node clients carry the short fixed
//! request timeout from `NetworkConfig`; stream-service clients are
//! bounded by the calling context instead (sync sessions stay open).

use crate::config::NetworkConfig;
use runnel_model::NodeAddress;
use runnel_proto::v1::node_to_node_client::NodeToNodeClient;
use runnel_proto::v1::stream_service_client::StreamServiceClient;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeAddress),

    #[error("cannot get a client for the local node: {0}")]
    LocalNode(NodeAddress),

    #[error("bad endpoint {url} for node {node}: {reason}")]
    BadEndpoint {
        node: NodeAddress,
        url: String,
        reason: String,
    },
}

#[derive(Default)]
struct Clients {
    stream: HashMap<NodeAddress, StreamServiceClient<Channel>>,
    node: HashMap<NodeAddress, NodeToNodeClient<Channel>>,
}

pub struct NodeRegistry {
    local_address: NodeAddress,
    config: NetworkConfig,
    endpoints: Mutex<HashMap<NodeAddress, String>>,
    clients: Mutex<Clients>,
}

impl NodeRegistry {
    pub fn new(
        local_address: NodeAddress,
        config: NetworkConfig,
        entries: impl IntoIterator<Item = (NodeAddress, String)>,
    ) -> Self {
        Self {
            local_address,
            config,
            endpoints: Mutex::new(entries.into_iter().collect()),
            clients: Mutex::new(Clients::default()),
        }
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local_address
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.lock_endpoints().keys().copied().collect()
    }

    /// Add or replace a node's endpoint, dropping any cached client so
    /// the next call reconnects to the new location.
    pub fn update_node(&self, address: NodeAddress, url: String) {
        self.lock_endpoints().insert(address, url);
        let mut clients = self.lock_clients();
        clients.stream.remove(&address);
        clients.node.remove(&address);
    }

    pub fn remove_node(&self, address: NodeAddress) {
        self.lock_endpoints().remove(&address);
        let mut clients = self.lock_clients();
        clients.stream.remove(&address);
        clients.node.remove(&address);
    }

    /// Stream-service client for a remote peer.
    pub fn stream_client(
        &self,
        address: NodeAddress,
    ) -> Result<StreamServiceClient<Channel>, RegistryError> {
        if let Some(client) = self.lock_clients().stream.get(&address) {
            return Ok(client.clone());
        }
        let channel = self.channel_for(address, None)?;
        let client = StreamServiceClient::new(channel);
        self.lock_clients().stream.insert(address, client.clone());
        Ok(client)
    }

    /// Node-to-node client for a remote peer, bounded by the fixed
    /// replication timeout.
    pub fn node_client(
        &self,
        address: NodeAddress,
    ) -> Result<NodeToNodeClient<Channel>, RegistryError> {
        if let Some(client) = self.lock_clients().node.get(&address) {
            return Ok(client.clone());
        }
        let channel = self.channel_for(address, Some(self.config.node_request_timeout))?;
        let client = NodeToNodeClient::new(channel);
        self.lock_clients().node.insert(address, client.clone());
        Ok(client)
    }

    fn channel_for(
        &self,
        address: NodeAddress,
        timeout: Option<std::time::Duration>,
    ) -> Result<Channel, RegistryError> {
        if address == self.local_address {
            return Err(RegistryError::LocalNode(address));
        }
        let url = self
            .lock_endpoints()
            .get(&address)
            .cloned()
            .ok_or(RegistryError::UnknownNode(address))?;
        let mut endpoint =
            Endpoint::from_shared(url.clone()).map_err(|e| RegistryError::BadEndpoint {
                node: address,
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if let Some(timeout) = timeout {
            endpoint = endpoint.timeout(timeout);
        }
        Ok(endpoint.connect_lazy())
    }

    fn lock_endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<NodeAddress, String>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, Clients> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}
