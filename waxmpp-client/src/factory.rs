//! Outbound stanza construction.
//!
//! Message ids are `{prefix}-{unix_ts}-{counter}` with a per-process
//! strictly increasing counter, so ids never repeat within a session.

use chrono::Utc;
use waxmpp_codec::Node;

/// Builds outbound nodes and allocates stanza ids.
pub(crate) struct NodeFactory {
    counter: u64,
    pub server: String,
    pub app_version: String,
}

impl NodeFactory {
    pub fn new(server: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            counter: 0,
            server: server.into(),
            app_version: app_version.into(),
        }
    }

    pub fn timestamp() -> String {
        Utc::now().timestamp().to_string()
    }

    /// Allocate the next stanza id.
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{}-{}", Utc::now().timestamp(), self.counter)
    }

    /// An outbound `message` shell with `to`/`type`/`id`/`t` set.
    pub fn message(&mut self, to: &str, message_type: &str) -> Node {
        let id = self.next_id("message");
        Node::new("message")
            .with_attribute("to", to)
            .with_attribute("type", message_type)
            .with_attribute("id", id)
            .with_attribute("t", Self::timestamp())
    }

    /// A plain text message.
    pub fn text_message(&mut self, to: &str, body: &[u8]) -> Node {
        self.message(to, "text")
            .with_child(Node::new("body").with_data(body))
    }

    /// A message wrapping an end-to-end ciphertext.
    pub fn enc_message(&mut self, to: &str, enc_type: &str, ciphertext: Vec<u8>) -> Node {
        let av = self.app_version.clone();
        self.message(to, "text").with_child(
            Node::new("enc")
                .with_attribute("v", "1")
                .with_attribute("type", enc_type)
                .with_attribute("av", av)
                .with_data(ciphertext),
        )
    }

    /// An `iq` shell addressed to `to` (the home server when `None`).
    /// Returns the node and its allocated id.
    pub fn iq(&mut self, iq_type: &str, xmlns: &str, to: Option<&str>) -> (Node, String) {
        let id = self.next_id("iq");
        let node = Node::new("iq")
            .with_attribute("id", id.clone())
            .with_attribute("xmlns", xmlns)
            .with_attribute("type", iq_type)
            .with_attribute("to", to.unwrap_or(&self.server));
        (node, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_distinct() {
        let mut f = NodeFactory::new("s.whatsapp.net", "2.12.96");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(f.next_id("message")));
        }
    }

    #[test]
    fn first_message_id_ends_in_one() {
        let mut f = NodeFactory::new("s.whatsapp.net", "2.12.96");
        let id = f.next_id("message");
        assert!(id.starts_with("message-"));
        assert!(id.ends_with("-1"));
    }

    #[test]
    fn message_shell_has_envelope_attributes() {
        let mut f = NodeFactory::new("s.whatsapp.net", "2.12.96");
        let node = f.text_message("31000000000@s.whatsapp.net", b"hello");
        assert_eq!(node.attribute("to"), Some("31000000000@s.whatsapp.net"));
        assert_eq!(node.attribute("type"), Some("text"));
        assert!(node.attribute("id").is_some());
        assert!(node.attribute("t").is_some());
        assert_eq!(node.child("body").unwrap().data(), Some(&b"hello"[..]));
    }
}
