//! Quorum write pool.
//!
//! One instance per logical write. The local replica write (if this
//! node hosts the stream) and one task per remote replica run
//! concurrently; `wait` resolves as soon as the outcome is decided.
//! The local write is the authority of record: its failure is fatal
//! regardless of remote results. Remote results are counted in
//! completion order against the majority threshold, and stragglers are
//! abandoned into the pool's own bounded channel so they can never
//! block a later write.

use runnel_model::NodeAddress;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;

pub struct QuorumPool {
    local: Option<JoinHandle<Result<(), Status>>>,
    remote_count: usize,
    scheduled_remotes: usize,
    tx: mpsc::Sender<Result<(), Status>>,
    rx: mpsc::Receiver<Result<(), Status>>,
}

impl QuorumPool {
    /// `remote_count` is the number of remote replicas that will be
    /// scheduled with `go_remote`; it sizes the result channel so that
    /// abandoned tasks always find room.
    pub fn new(remote_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(remote_count.max(1));
        Self {
            local: None,
            remote_count,
            scheduled_remotes: 0,
            tx,
            rx,
        }
    }

    /// Schedule the local replica write. At most one per pool.
    pub fn go_local<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), Status>> + Send + 'static,
    {
        debug_assert!(self.local.is_none(), "local task scheduled twice");
        self.local = Some(tokio::spawn(task));
    }

    /// Schedule one remote replica write. Call once per remote.
    pub fn go_remote<F>(&mut self, node: NodeAddress, task: F)
    where
        F: Future<Output = Result<(), Status>> + Send + 'static,
    {
        debug_assert!(
            self.scheduled_remotes < self.remote_count,
            "more remote tasks than the pool was sized for"
        );
        self.scheduled_remotes += 1;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = task.await;
            if let Err(err) = &result {
                tracing::debug!(node = %node, error = %err, "remote replica write failed");
            }
            // The receiver may be gone if the pool exited early; the
            // channel is sized so a live receiver always has room.
            let _ = tx.try_send(result);
        });
    }

    /// Resolve the write. Returns `Ok` once a majority of all replicas
    /// (local included, when scheduled) has acknowledged, or the first
    /// observed error once the majority is unreachable.
    pub async fn wait(self) -> Result<(), Status> {
        let QuorumPool {
            local,
            remote_count,
            tx,
            mut rx,
            ..
        } = self;
        // Our own sender must go away so `recv` can observe completion
        // of all remote tasks in the defensive path below.
        drop(tx);

        let local_participated = match local {
            Some(handle) => {
                match handle.await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => {
                        return Err(Status::internal(format!(
                            "local replica task panicked: {join_err}"
                        )))
                    }
                }
            }
            None => false,
        };

        let total = remote_count + usize::from(local_participated);
        let quorum = (total + 2) / 2; // ceil((n + 1) / 2)
        let required = quorum - usize::from(local_participated);
        if required == 0 {
            return Ok(());
        }
        if required > remote_count {
            return Err(Status::internal("quorum pool has no replicas to write to"));
        }
        let allowed_failures = remote_count - required;

        let mut successes = 0usize;
        let mut failures = 0usize;
        let mut first_error: Option<Status> = None;

        while successes < required {
            match rx.recv().await {
                Some(Ok(())) => successes += 1,
                Some(Err(err)) => {
                    failures += 1;
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    if failures > allowed_failures {
                        break;
                    }
                }
                // All scheduled tasks finished without deciding the
                // outcome; cannot happen when the caller scheduled
                // remote_count tasks, handled defensively.
                None => break,
            }
        }

        if successes >= required {
            Ok(())
        } else {
            Err(first_error
                .unwrap_or_else(|| Status::internal("quorum not reached with no recorded error")))
        }
    }
}
