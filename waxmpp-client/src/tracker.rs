//! In-flight request bookkeeping.
//!
//! Every outbound `iq` carries a generated id; the tracker pairs it with a
//! one-shot completion that the dispatch loop resolves when the matching
//! reply (or server ack) arrives.

use std::collections::HashMap;

use tokio::sync::oneshot;
use waxmpp_codec::Node;

use crate::errors::ClientError;

type Completion = oneshot::Sender<Result<Node, ClientError>>;

/// Map of pending request id → completion.
#[derive(Default)]
pub(crate) struct RequestTracker {
    pending: HashMap<String, Completion>,
}

impl RequestTracker {
    /// Register a completion for `id`, returning the receiving end.
    pub fn track(&mut self, id: &str) -> oneshot::Receiver<Result<Node, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        rx
    }

    /// Register an externally created completion for `id`.
    pub fn register(&mut self, id: &str, tx: Completion) {
        self.pending.insert(id.to_string(), tx);
    }

    /// `true` if `id` has a waiter.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Resolve `id` with a reply node. Returns `false` if nothing waited.
    pub fn resolve(&mut self, id: &str, node: Node) -> bool {
        match self.pending.remove(id) {
            Some(tx) => tx.send(Ok(node)).is_ok(),
            None => false,
        }
    }

    /// Resolve `id` with an error. Returns `false` if nothing waited.
    pub fn fail(&mut self, id: &str, error: ClientError) -> bool {
        match self.pending.remove(id) {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Resolve everything still pending with [`ClientError::Disconnected`].
    pub fn fail_all(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_reaches_the_waiter() {
        let mut tracker = RequestTracker::default();
        let rx = tracker.track("iq-1");
        assert!(tracker.is_tracked("iq-1"));
        assert!(tracker.resolve("iq-1", Node::new("iq")));
        assert!(!tracker.is_tracked("iq-1"));
        assert_eq!(rx.await.unwrap().unwrap().tag(), "iq");
    }

    #[tokio::test]
    async fn unknown_id_resolves_nothing() {
        let mut tracker = RequestTracker::default();
        assert!(!tracker.resolve("nope", Node::new("iq")));
    }

    #[tokio::test]
    async fn fail_all_on_disconnect() {
        let mut tracker = RequestTracker::default();
        let rx1 = tracker.track("a");
        let rx2 = tracker.track("b");
        tracker.fail_all();
        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Disconnected)));
    }
}
