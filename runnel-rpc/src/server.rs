//! RPC server bootstrap.

use crate::node2node::NodeToNodeImpl;
use crate::service::{ServiceCore, StreamServiceImpl};
use runnel_proto::v1::node_to_node_server::NodeToNodeServer;
use runnel_proto::v1::stream_service_server::StreamServiceServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

/// Serves both the client-facing stream service and the replica-facing
/// node-to-node service on one TCP listener.
pub struct RpcServer {
    core: Arc<ServiceCore>,
    listener: TcpListener,
}

impl RpcServer {
    pub fn new(core: Arc<ServiceCore>, listener: TcpListener) -> Self {
        Self { core, listener }
    }

    /// Bind the listener. Binding is split from serving so callers can
    /// learn the effective address when binding port 0.
    pub async fn bind(core: Arc<ServiceCore>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(core, listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the server until the process stops or `shutdown` resolves.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), tonic::transport::Error> {
        let addr = self.listener.local_addr().ok();
        tracing::info!(?addr, "rpc server listening");

        let stream_service = StreamServiceImpl::new(self.core.clone());
        let node_service = NodeToNodeImpl::new(self.core);

        Server::builder()
            .add_service(StreamServiceServer::new(stream_service))
            .add_service(NodeToNodeServer::new(node_service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), shutdown)
            .await
    }

    pub async fn serve(self) -> Result<(), tonic::transport::Error> {
        self.serve_with_shutdown(std::future::pending()).await
    }
}
