//! Replica set of one stream with sticky-peer selection.
//!
//! The sticky peer is the remote replica currently preferred for
//! forwarded requests. It only moves when a caller reports the current
//! peer as failing, and advancement is keyed on the observed address so
//! concurrent failure reports cannot skip past a healthy peer.

use runnel_model::NodeAddress;
use std::sync::Mutex;

#[derive(Debug)]
struct Inner {
    nodes: Vec<NodeAddress>,
    remotes: Vec<NodeAddress>,
    is_local: bool,
    sticky: usize,
}

/// Ordered replica addresses of one stream, as seen from one node.
#[derive(Debug)]
pub struct StreamNodes {
    local_address: NodeAddress,
    inner: Mutex<Inner>,
}

impl StreamNodes {
    pub fn new(nodes: Vec<NodeAddress>, local_address: NodeAddress) -> Self {
        let remotes: Vec<NodeAddress> =
            nodes.iter().copied().filter(|n| *n != local_address).collect();
        let is_local = remotes.len() != nodes.len();
        Self {
            local_address,
            inner: Mutex::new(Inner {
                nodes,
                remotes,
                is_local,
                sticky: 0,
            }),
        }
    }

    /// Whether this node holds a replica of the stream.
    pub fn is_local(&self) -> bool {
        self.lock().is_local
    }

    pub fn num_remotes(&self) -> usize {
        self.lock().remotes.len()
    }

    pub fn remotes(&self) -> Vec<NodeAddress> {
        self.lock().remotes.clone()
    }

    pub fn all(&self) -> Vec<NodeAddress> {
        self.lock().nodes.clone()
    }

    /// The remote replica currently preferred for forwarded requests.
    pub fn sticky_peer(&self) -> Option<NodeAddress> {
        let inner = self.lock();
        inner.remotes.get(inner.sticky).copied()
    }

    /// Move the cursor past `failing`, but only if it is still the
    /// currently selected peer. Duplicate reports for the same failure
    /// are tolerated without over-advancing.
    pub fn advance_sticky_peer(&self, failing: NodeAddress) {
        let mut inner = self.lock();
        if inner.remotes.is_empty() {
            return;
        }
        if inner.remotes[inner.sticky] == failing {
            inner.sticky = (inner.sticky + 1) % inner.remotes.len();
        }
    }

    /// Apply a placement change in place. The sticky cursor keeps
    /// pointing at the same address when that address survives the
    /// change, and falls back to the front of the list otherwise.
    pub fn update(&self, nodes: Vec<NodeAddress>) {
        let mut inner = self.lock();
        let current = inner.remotes.get(inner.sticky).copied();
        let remotes: Vec<NodeAddress> = nodes
            .iter()
            .copied()
            .filter(|n| *n != self.local_address)
            .collect();
        inner.is_local = remotes.len() != nodes.len();
        inner.sticky = current
            .and_then(|peer| remotes.iter().position(|n| *n == peer))
            .unwrap_or(0);
        inner.remotes = remotes;
        inner.nodes = nodes;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Inner holds plain data, a poisoned lock cannot leave it torn.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> NodeAddress {
        NodeAddress([b; 20])
    }

    #[test]
    fn splits_local_and_remotes() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2), addr(3)], addr(2));
        assert!(nodes.is_local());
        assert_eq!(nodes.num_remotes(), 2);
        assert_eq!(nodes.remotes(), vec![addr(1), addr(3)]);
        assert_eq!(nodes.all().len(), 3);
    }

    #[test]
    fn non_replica_has_all_remotes() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2)], addr(9));
        assert!(!nodes.is_local());
        assert_eq!(nodes.num_remotes(), 2);
    }

    #[test]
    fn sticky_advances_and_wraps() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2), addr(3)], addr(9));
        assert_eq!(nodes.sticky_peer(), Some(addr(1)));
        nodes.advance_sticky_peer(addr(1));
        assert_eq!(nodes.sticky_peer(), Some(addr(2)));
        nodes.advance_sticky_peer(addr(2));
        nodes.advance_sticky_peer(addr(3));
        assert_eq!(nodes.sticky_peer(), Some(addr(1)));
    }

    #[test]
    fn duplicate_advance_is_ignored() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2), addr(3)], addr(9));
        nodes.advance_sticky_peer(addr(1));
        // A second report for the peer that already rotated out must not
        // skip past the now-current one.
        nodes.advance_sticky_peer(addr(1));
        assert_eq!(nodes.sticky_peer(), Some(addr(2)));
    }

    #[test]
    fn update_preserves_surviving_sticky_peer() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2), addr(3)], addr(9));
        nodes.advance_sticky_peer(addr(1));
        assert_eq!(nodes.sticky_peer(), Some(addr(2)));

        nodes.update(vec![addr(2), addr(4)]);
        assert_eq!(nodes.sticky_peer(), Some(addr(2)));

        nodes.update(vec![addr(5), addr(6)]);
        assert_eq!(nodes.sticky_peer(), Some(addr(5)));
    }

    #[test]
    fn update_can_change_locality() {
        let nodes = StreamNodes::new(vec![addr(1), addr(2)], addr(2));
        assert!(nodes.is_local());
        nodes.update(vec![addr(1), addr(3)]);
        assert!(!nodes.is_local());
        assert_eq!(nodes.num_remotes(), 2);
    }
}
