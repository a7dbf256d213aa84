//! Tunables of the RPC layer.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Default retry budget for forwarded peer requests. The effective
    /// budget is additionally capped by the number of distinct remotes.
    pub num_retries: usize,

    /// Fixed ceiling on replica-to-replica calls. Deliberately short
    /// and independent of any client-facing deadline.
    pub node_request_timeout: Duration,

    /// Minipool size at which the hosting node seals a miniblock.
    pub minipool_seal_size: usize,

    /// Per-session bound on queued data updates. Overflow is fatal to
    /// the session.
    pub data_queue_size: usize,

    /// Per-session bound on queued control messages. Overflow drops the
    /// message and fails the request that queued it.
    pub control_queue_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_retries: 3,
            node_request_timeout: Duration::from_secs(5),
            minipool_seal_size: 16,
            data_queue_size: 256,
            control_queue_size: 64,
        }
    }
}
