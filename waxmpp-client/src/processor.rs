//! Inbound `message` node classification.
//!
//! An ordered list of matchers; the first whose `matches` accepts the node
//! produces the typed payload. Messages nothing matches are dropped here;
//! the interesting non-chat stanzas are already handled at dispatch level.

use waxmpp_codec::Node;

use crate::events::{IncomingMessage, MediaContent, MessageKind};

/// One message shape the processor recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Matcher {
    Text,
    Location,
    Image,
    Video,
    Audio,
    Vcard,
}

impl Matcher {
    fn media_type<'n>(node: &'n Node) -> Option<&'n str> {
        node.child("media").and_then(|m| m.attribute("type"))
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self {
            Self::Text => node.child("body").is_some(),
            Self::Location => Self::media_type(node) == Some("location"),
            Self::Image => Self::media_type(node) == Some("image"),
            Self::Video => Self::media_type(node) == Some("video"),
            Self::Audio => Self::media_type(node) == Some("audio"),
            Self::Vcard => Self::media_type(node) == Some("vcard"),
        }
    }

    pub fn process(&self, node: &Node) -> Option<MessageKind> {
        match self {
            Self::Text => {
                let body = node.child("body")?;
                Some(MessageKind::Text {
                    body: body.data_string().unwrap_or_default(),
                })
            }
            Self::Location => {
                let media = node.child("media")?;
                Some(MessageKind::Location {
                    latitude: media.attribute("latitude")?.parse().ok()?,
                    longitude: media.attribute("longitude")?.parse().ok()?,
                    name: media.attribute("name").map(str::to_string),
                    url: media.attribute("url").map(str::to_string),
                    thumbnail: media.data().map(<[u8]>::to_vec).unwrap_or_default(),
                })
            }
            Self::Image => Some(MessageKind::Image(media_content(node.child("media")?))),
            Self::Video => Some(MessageKind::Video(media_content(node.child("media")?))),
            Self::Audio => Some(MessageKind::Audio(media_content(node.child("media")?))),
            Self::Vcard => {
                let media = node.child("media")?;
                let card = media.child("vcard")?;
                Some(MessageKind::Vcard {
                    name: card.attribute("name").unwrap_or_default().to_string(),
                    vcard: card.data().map(<[u8]>::to_vec).unwrap_or_default(),
                })
            }
        }
    }
}

fn media_content(media: &Node) -> MediaContent {
    MediaContent {
        url: media.attribute("url").unwrap_or_default().to_string(),
        size: media
            .attribute("size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        file: media.attribute("file").unwrap_or_default().to_string(),
        encoding: media.attribute("encoding").map(str::to_string),
        ip: media.attribute("ip").map(str::to_string),
        mimetype: media.attribute("mimetype").map(str::to_string),
        filehash: media.attribute("filehash").map(str::to_string),
        width: media.attribute("width").and_then(|s| s.parse().ok()),
        height: media.attribute("height").and_then(|s| s.parse().ok()),
        duration: media.attribute("duration").and_then(|s| s.parse().ok()),
        codecs: media.attribute("acodec").map(str::to_string),
        thumbnail: media.data().map(<[u8]>::to_vec).unwrap_or_default(),
        caption: media.attribute("caption").map(str::to_string),
    }
}

/// The ordered matcher list.
pub(crate) struct MessageProcessor {
    matchers: Vec<Matcher>,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self {
            matchers: vec![
                Matcher::Text,
                Matcher::Location,
                Matcher::Image,
                Matcher::Video,
                Matcher::Audio,
                Matcher::Vcard,
            ],
        }
    }

    /// Classify a `message` node. Exactly one matcher fires; `None` means
    /// the message carried nothing we surface.
    pub fn process(&self, node: &Node) -> Option<IncomingMessage> {
        let kind = self
            .matchers
            .iter()
            .find(|m| m.matches(node))
            .and_then(|m| m.process(node))?;

        Some(IncomingMessage {
            from: node.attribute("from").unwrap_or_default().to_string(),
            id: node.attribute("id").unwrap_or_default().to_string(),
            timestamp: node
                .attribute("t")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0),
            notify: node.attribute("notify").map(str::to_string),
            author: node.attribute("participant").map(str::to_string),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message() -> Node {
        Node::new("message")
            .with_attribute("from", "31000000000@s.whatsapp.net")
            .with_attribute("id", "abc")
            .with_attribute("type", "text")
            .with_attribute("t", "1700000000")
            .with_attribute("notify", "Bob")
            .with_child(Node::new("body").with_data(&b"hi"[..]))
    }

    #[test]
    fn text_is_matched_first() {
        let p = MessageProcessor::new();
        let msg = p.process(&text_message()).unwrap();
        assert_eq!(msg.from, "31000000000@s.whatsapp.net");
        assert_eq!(msg.id, "abc");
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert_eq!(msg.notify.as_deref(), Some("Bob"));
        assert!(matches!(msg.kind, MessageKind::Text { ref body } if body == "hi"));
    }

    #[test]
    fn image_is_signalled_by_media_type() {
        let node = Node::new("message")
            .with_attribute("from", "x@s.whatsapp.net")
            .with_attribute("id", "m1")
            .with_attribute("t", "1")
            .with_child(
                Node::new("media")
                    .with_attribute("type", "image")
                    .with_attribute("url", "https://mms.example/f.jpg")
                    .with_attribute("size", "1024")
                    .with_attribute("file", "f.jpg")
                    .with_attribute("mimetype", "image/jpeg")
                    .with_attribute("width", "640")
                    .with_attribute("height", "480")
                    .with_attribute("caption", "sunset")
                    .with_data(&b"\xff\xd8jpeg"[..]),
            );
        let msg = MessageProcessor::new().process(&node).unwrap();
        let MessageKind::Image(media) = msg.kind else {
            panic!("expected image");
        };
        assert_eq!(media.url, "https://mms.example/f.jpg");
        assert_eq!(media.size, 1024);
        assert_eq!(media.width, Some(640));
        assert_eq!(media.caption.as_deref(), Some("sunset"));
        assert_eq!(media.thumbnail, b"\xff\xd8jpeg");
    }

    #[test]
    fn location_parses_coordinates() {
        let node = Node::new("message")
            .with_attribute("from", "x@s.whatsapp.net")
            .with_attribute("id", "m2")
            .with_child(
                Node::new("media")
                    .with_attribute("type", "location")
                    .with_attribute("latitude", "52.3702")
                    .with_attribute("longitude", "4.8952")
                    .with_attribute("name", "Amsterdam"),
            );
        let msg = MessageProcessor::new().process(&node).unwrap();
        let MessageKind::Location {
            latitude,
            longitude,
            name,
            ..
        } = msg.kind
        else {
            panic!("expected location");
        };
        assert!((latitude - 52.3702).abs() < 1e-9);
        assert!((longitude - 4.8952).abs() < 1e-9);
        assert_eq!(name.as_deref(), Some("Amsterdam"));
    }

    #[test]
    fn vcard_keeps_raw_bytes() {
        let node = Node::new("message")
            .with_attribute("from", "x@s.whatsapp.net")
            .with_attribute("id", "m3")
            .with_child(
                Node::new("media").with_attribute("type", "vcard").with_child(
                    Node::new("vcard")
                        .with_attribute("name", "Alice")
                        .with_data(&b"BEGIN:VCARD\nEND:VCARD"[..]),
                ),
            );
        let msg = MessageProcessor::new().process(&node).unwrap();
        let MessageKind::Vcard { name, vcard } = msg.kind else {
            panic!("expected vcard");
        };
        assert_eq!(name, "Alice");
        assert_eq!(vcard, b"BEGIN:VCARD\nEND:VCARD");
    }

    #[test]
    fn exactly_one_matcher_fires() {
        let p = MessageProcessor::new();
        let node = text_message();
        let hits = [
            Matcher::Text,
            Matcher::Location,
            Matcher::Image,
            Matcher::Video,
            Matcher::Audio,
            Matcher::Vcard,
        ]
        .iter()
        .filter(|m| m.matches(&node))
        .count();
        assert_eq!(hits, 1);
        assert!(p.process(&node).is_some());
    }

    #[test]
    fn unmatched_message_is_discarded() {
        let node = Node::new("message")
            .with_attribute("from", "x@s.whatsapp.net")
            .with_child(Node::new("received"));
        assert!(MessageProcessor::new().process(&node).is_none());
    }
}
