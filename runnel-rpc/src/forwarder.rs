//! Peer request forwarding with failover.
//!
//! Requests for streams this node does not host are issued against the
//! stream's current sticky peer. A transient network failure advances
//! the sticky peer and retries; application errors surface immediately.
//! The retry budget never exceeds the number of distinct remotes, since
//! re-asking an unreachable node buys nothing.

use crate::config::NetworkConfig;
use runnel_model::NodeAddress;
use runnel_node::StreamNodes;
use std::future::Future;
use tonic::{Code, Status};

/// Whether an error means "this peer is unreachable" as opposed to an
/// application-level verdict that would be identical on every replica.
pub fn is_transient(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable)
}

/// Issue a unary request against the current sticky peer, rotating on
/// transient failure. `max_retries` of 0 selects the configured
/// default.
pub async fn forward_unary<T, F, Fut>(
    nodes: &StreamNodes,
    config: &NetworkConfig,
    max_retries: usize,
    mut attempt: F,
) -> Result<T, Status>
where
    F: FnMut(NodeAddress) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let budget = effective_retries(nodes, config, max_retries)?;

    let mut last_error: Option<Status> = None;
    for retry in 0..budget {
        let Some(peer) = nodes.sticky_peer() else {
            break;
        };
        match attempt(peer).await {
            Ok(response) => return Ok(response),
            Err(status) if is_transient(&status) => {
                tracing::debug!(peer = %peer, retry, error = %status, "peer unavailable, rotating");
                nodes.advance_sticky_peer(peer);
                last_error = Some(status);
            }
            Err(status) => return Err(status),
        }
    }

    Err(last_error.unwrap_or_else(|| Status::unavailable("all peer attempts failed")))
}

/// Error of one streaming attempt, recording whether data had already
/// been relayed downstream when the attempt broke.
pub struct StreamBreak {
    pub has_streamed: bool,
    pub status: Status,
}

impl StreamBreak {
    pub fn before_data(status: Status) -> Self {
        Self {
            has_streamed: false,
            status,
        }
    }

    pub fn mid_stream(status: Status) -> Self {
        Self {
            has_streamed: true,
            status,
        }
    }
}

/// Streaming variant of [`forward_unary`]. Once an attempt has relayed
/// any data downstream it is never retried — a partially delivered
/// stream cannot be replayed into the same sink — so a mid-stream break
/// surfaces immediately even when transient.
pub async fn forward_streaming<F, Fut>(
    nodes: &StreamNodes,
    config: &NetworkConfig,
    max_retries: usize,
    mut attempt: F,
) -> Result<(), Status>
where
    F: FnMut(NodeAddress) -> Fut,
    Fut: Future<Output = Result<(), StreamBreak>>,
{
    let budget = effective_retries(nodes, config, max_retries)?;

    let mut last_error: Option<Status> = None;
    for retry in 0..budget {
        let Some(peer) = nodes.sticky_peer() else {
            break;
        };
        match attempt(peer).await {
            Ok(()) => return Ok(()),
            Err(brk) if is_transient(&brk.status) && !brk.has_streamed => {
                tracing::debug!(peer = %peer, retry, error = %brk.status, "peer unavailable, rotating");
                nodes.advance_sticky_peer(peer);
                last_error = Some(brk.status);
            }
            Err(brk) => return Err(brk.status),
        }
    }

    Err(last_error.unwrap_or_else(|| Status::unavailable("all peer attempts failed")))
}

fn effective_retries(
    nodes: &StreamNodes,
    config: &NetworkConfig,
    max_retries: usize,
) -> Result<usize, Status> {
    let remotes = nodes.num_remotes();
    if remotes == 0 {
        return Err(Status::internal(
            "cannot forward peer request: no nodes available",
        ));
    }
    let requested = if max_retries > 0 {
        max_retries
    } else {
        config.num_retries.max(1)
    };
    Ok(requested.min(remotes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn addr(b: u8) -> NodeAddress {
        NodeAddress([b; 20])
    }

    fn remote_nodes(count: u8) -> StreamNodes {
        StreamNodes::new((1..=count).map(addr).collect(), addr(99))
    }

    #[tokio::test]
    async fn no_remotes_fails_immediately() {
        let nodes = StreamNodes::new(vec![addr(1)], addr(1));
        let config = NetworkConfig::default();
        let result = forward_unary(&nodes, &config, 0, |_| async { Ok::<(), Status>(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rotates_past_transient_failures() {
        let nodes = remote_nodes(3);
        let config = NetworkConfig::default();
        let attempts: Arc<Mutex<Vec<NodeAddress>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = attempts.clone();
        let value = forward_unary(&nodes, &config, 5, move |peer| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(peer);
                if peer == addr(3) {
                    Ok(42u32)
                } else {
                    Err(Status::unavailable("down"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        // Capped at 3 distinct peers, each tried once.
        assert_eq!(attempts.lock().unwrap().as_slice(), &[addr(1), addr(2), addr(3)]);
    }

    #[tokio::test]
    async fn application_errors_abort_without_rotation() {
        let nodes = remote_nodes(3);
        let config = NetworkConfig::default();
        let attempts = Arc::new(Mutex::new(0usize));

        let counter = attempts.clone();
        let err = forward_unary(&nodes, &config, 0, move |_peer| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err::<(), Status>(Status::invalid_argument("bad request"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(*attempts.lock().unwrap(), 1);
        assert_eq!(nodes.sticky_peer(), Some(addr(1)));
    }

    #[tokio::test]
    async fn budget_is_capped_by_remote_count() {
        let nodes = remote_nodes(2);
        let config = NetworkConfig::default();
        let attempts = Arc::new(Mutex::new(0usize));

        let counter = attempts.clone();
        let err = forward_unary(&nodes, &config, 10, move |_peer| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err::<(), Status>(Status::unavailable("down"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn streaming_does_not_retry_after_partial_delivery() {
        let nodes = remote_nodes(3);
        let config = NetworkConfig::default();
        let attempts = Arc::new(Mutex::new(0usize));

        let counter = attempts.clone();
        let err = forward_streaming(&nodes, &config, 0, move |_peer| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(StreamBreak::mid_stream(Status::unavailable("died mid-stream")))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn streaming_retries_when_nothing_was_relayed() {
        let nodes = remote_nodes(2);
        let config = NetworkConfig::default();

        let result = forward_streaming(&nodes, &config, 0, move |peer| async move {
            if peer == addr(2) {
                Ok(())
            } else {
                Err(StreamBreak::before_data(Status::unavailable("down")))
            }
        })
        .await;

        assert!(result.is_ok());
    }
}
