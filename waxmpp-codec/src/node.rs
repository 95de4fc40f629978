//! The in-memory protocol tree.

use std::fmt;

/// A single protocol element: tag, ordered attributes, children, and an
/// optional opaque payload.
///
/// On the wire a node carries either children or a payload, never both; in
/// memory both may be set and the writer emits the children if non-empty.
/// Attribute order is preserved because it is part of the wire encoding.
#[derive(Clone, Default, PartialEq)]
pub struct Node {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    data: Option<Vec<u8>>,
}

impl Node {
    /// Create an empty node with the given tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// The element tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    // ── Attributes ─────────────────────────────────────────────────────────

    /// Attribute value by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in wire order.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Set an attribute, replacing any existing value for the same key
    /// (keys are unique within a node).
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Builder-style [`Node::set_attribute`].
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    // ── Children ───────────────────────────────────────────────────────────

    /// First child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// All children.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// `true` if a child with the given tag exists.
    pub fn has_child(&self, tag: &str) -> bool {
        self.child(tag).is_some()
    }

    /// Append a child node.
    pub fn push_child(&mut self, child: Node) {
        self.children.push(child);
    }

    /// Builder-style [`Node::push_child`].
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    // ── Payload ────────────────────────────────────────────────────────────

    /// The opaque payload, if any.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Payload decoded as UTF-8 (lossy).
    pub fn data_string(&self) -> Option<String> {
        self.data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// Set the opaque payload.
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.data = Some(data.into());
    }

    /// Builder-style [`Node::set_data`].
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attributes {
            write!(f, " {k}={v:?}")?;
        }
        if self.children.is_empty() && self.data.is_none() {
            return write!(f, "/>");
        }
        write!(f, ">")?;
        for c in &self.children {
            write!(f, "{c:?}")?;
        }
        if let Some(d) = &self.data {
            match std::str::from_utf8(d) {
                Ok(s) => write!(f, "{s}")?,
                Err(_) => write!(f, "[{} bytes]", d.len())?,
            }
        }
        write!(f, "</{}>", self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_attribute_replaces_existing_key() {
        let mut n = Node::new("message");
        n.set_attribute("type", "text");
        n.set_attribute("type", "media");
        assert_eq!(n.attributes().len(), 1);
        assert_eq!(n.attribute("type"), Some("media"));
    }

    #[test]
    fn attribute_order_is_preserved() {
        let n = Node::new("message")
            .with_attribute("to", "x")
            .with_attribute("type", "text")
            .with_attribute("id", "1");
        let keys: Vec<_> = n.attributes().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["to", "type", "id"]);
    }

    #[test]
    fn child_lookup_finds_first() {
        let n = Node::new("iq")
            .with_child(Node::new("query").with_attribute("seconds", "1"))
            .with_child(Node::new("query").with_attribute("seconds", "2"));
        assert_eq!(n.child("query").unwrap().attribute("seconds"), Some("1"));
        assert!(!n.has_child("ping"));
    }
}
