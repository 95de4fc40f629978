//! Outbound queues.
//!
//! [`SendQueue`] buffers message nodes composed before login and releases
//! them, in submission order, on the transition to the logged-in state.
//! [`MediaRequestQueue`] remembers what an upload-slot `iq` was about so
//! the matching reply can resume the two-phase media send.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use waxmpp_codec::Node;

// ─── SendQueue ───────────────────────────────────────────────────────────────

/// Pre-login message buffer.
#[derive(Default)]
pub(crate) struct SendQueue {
    items: VecDeque<Node>,
}

impl SendQueue {
    pub fn push(&mut self, node: Node) {
        self.items.push_back(node);
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<Node> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

// ─── MediaRequestQueue ───────────────────────────────────────────────────────

/// What kind of media a pending upload carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    /// The `type` attribute on media nodes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// One media send awaiting its upload-slot reply.
#[derive(Debug)]
pub(crate) struct PendingMedia {
    pub to: String,
    pub path: PathBuf,
    pub size: u64,
    pub kind: MediaKind,
    pub caption: Option<String>,
}

/// Upload-slot `iq` id → the send it belongs to.
#[derive(Default)]
pub(crate) struct MediaRequestQueue {
    pending: HashMap<String, PendingMedia>,
}

impl MediaRequestQueue {
    pub fn insert(&mut self, id: &str, media: PendingMedia) {
        self.pending.insert(id.to_string(), media);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn take(&mut self, id: &str) -> Option<PendingMedia> {
        self.pending.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_queue_preserves_order() {
        let mut q = SendQueue::default();
        q.push(Node::new("message").with_attribute("id", "1"));
        q.push(Node::new("message").with_attribute("id", "2"));
        q.push(Node::new("message").with_attribute("id", "3"));
        assert_eq!(q.len(), 3);

        let ids: Vec<_> = q
            .drain()
            .iter()
            .map(|n| n.attribute("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn media_queue_takes_once() {
        let mut q = MediaRequestQueue::default();
        q.insert(
            "iq-7",
            PendingMedia {
                to: "x@s.whatsapp.net".into(),
                path: "/tmp/p.jpg".into(),
                size: 10,
                kind: MediaKind::Image,
                caption: None,
            },
        );
        assert!(q.contains("iq-7"));
        assert!(q.take("iq-7").is_some());
        assert!(q.take("iq-7").is_none());
    }
}
