//! The fixed token tables.
//!
//! Tags, attribute names, and common attribute values are compressed to
//! single-byte tokens against the primary table, or to a two-byte form
//! (prefix 236..=243 plus index) against one of the secondary tables. Both
//! ends must use byte-identical tables; bumping the dictionary is a
//! forward-incompatible protocol change.

use std::collections::HashMap;

/// Indices 0..=2 of the primary table are reserved and never emitted.
const RESERVED: usize = 3;

#[rustfmt::skip]
const PRIMARY: &[&str] = &[
    "", "", "",
    "account", "ack", "action", "active", "add", "after", "all", "allow",
    "apple", "audio", "auth", "author", "available", "bad-protocol",
    "bad-request", "before", "body", "broadcast", "cancel", "category",
    "challenge", "chat", "clean", "code", "composing", "config", "contacts",
    "count", "create", "creation", "debug", "default", "delete", "delivery",
    "delta", "deny", "digest", "dirty", "duplicate", "elapsed", "enable",
    "encoding", "encrypt", "error", "event", "expiration", "expired", "fail",
    "failure", "false", "features", "feature", "field", "file", "filehash",
    "first", "free", "from", "g.us", "get", "google", "group", "groups",
    "groups_v2", "http://etherx.jabber.org/streams",
    "http://jabber.org/protocol/chatstates", "ib", "id", "identity", "image",
    "img", "index", "internal-server-error", "iq", "item-not-found", "item",
    "jabber:iq:last", "jabber:iq:privacy", "jabber:x:delay", "jabber:x:event",
    "jid", "kind", "last", "latitude", "leave", "list", "location",
    "longitude", "max", "mcc", "media", "message", "message_acks", "meta",
    "microsoft", "missing", "mnc", "mode", "modify", "msg", "mute", "name",
    "nokia", "none", "not-acceptable", "not-allowed", "not-authorized",
    "notification", "notify", "off", "offline", "order", "owner", "owning",
    "paid", "participant", "participants", "paused", "picture", "ping",
    "pkmsg", "platform", "port", "presence", "preview", "privacy", "probe",
    "prop", "props", "query", "raw", "read", "readreceipts", "reason",
    "receipt", "received", "registration", "relay", "remove", "request",
    "required", "resource", "response", "result", "retry", "rim",
    "s.whatsapp.net", "seconds", "server", "set", "show", "silent", "skey",
    "sound", "stamp", "status", "stream:error", "stream:features", "subject",
];

#[rustfmt::skip]
const SECONDARY: &[&[&str]] = &[
    // Table 0 (prefix 236): remaining stanza vocabulary.
    &[
        "subscribe", "success", "sync", "system", "t", "text", "timeout",
        "timestamp", "to", "true", "type", "unavailable", "unsubscribe",
        "uri", "url", "urn:ietf:params:xml:ns:xmpp-sasl",
        "urn:ietf:params:xml:ns:xmpp-stanzas",
        "urn:ietf:params:xml:ns:xmpp-streams", "urn:xmpp:ping",
        "urn:xmpp:receipts", "urn:xmpp:whatsapp:account",
        "urn:xmpp:whatsapp:dirty", "urn:xmpp:whatsapp:mms",
        "urn:xmpp:whatsapp:push", "user", "user-not-found", "value", "vcard",
        "version", "video", "w", "w:g", "w:g2", "w:p", "w:p:r",
        "w:profile:picture", "wait", "WAUTH-2", "xmlns", "xmlns:stream",
        "extend", "pricing",
    ],
    // Table 1 (prefix 237): media encodings and mime types.
    &[
        "mimetype", "width", "height", "duration", "vcodec", "acodec",
        "caption", "ip", "image/jpeg", "image/png", "image/gif", "video/mp4",
        "video/3gpp", "audio/aac", "audio/amr", "audio/mpeg", "audio/ogg",
        "audio/wav", "match", "size", "asize", "origin", "seen",
    ],
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Token {
    /// Single-byte token: an index into the primary table.
    Primary(u8),
    /// Two-byte token: secondary table number plus index within it.
    Secondary(u8, u8),
}

/// The fixed two-level token table shared by [`crate::Reader`] and
/// [`crate::Writer`].
pub struct Dictionary {
    index: HashMap<&'static str, Token>,
}

impl Dictionary {
    /// Token for a string, if the dictionary carries it.
    pub(crate) fn token_of(&self, s: &str) -> Option<Token> {
        self.index.get(s).copied()
    }

    /// String for a single-byte token.
    pub(crate) fn primary(&self, token: u8) -> Option<&'static str> {
        let idx = token as usize;
        if idx < RESERVED {
            return None;
        }
        PRIMARY.get(idx).copied()
    }

    /// String for a two-byte token.
    pub(crate) fn secondary(&self, table: u8, index: u8) -> Option<&'static str> {
        SECONDARY
            .get(table as usize)
            .and_then(|t| t.get(index as usize))
            .copied()
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        let mut index = HashMap::new();
        for (i, s) in PRIMARY.iter().enumerate().skip(RESERVED) {
            index.insert(*s, Token::Primary(i as u8));
        }
        for (t, table) in SECONDARY.iter().enumerate() {
            for (i, s) in table.iter().enumerate() {
                index.insert(*s, Token::Secondary(t as u8, i as u8));
            }
        }
        Self { index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_roundtrip() {
        let d = Dictionary::default();
        let Some(Token::Primary(t)) = d.token_of("message") else {
            panic!("message must be a primary token");
        };
        assert_eq!(d.primary(t), Some("message"));
    }

    #[test]
    fn secondary_roundtrip() {
        let d = Dictionary::default();
        let Some(Token::Secondary(table, i)) = d.token_of("type") else {
            panic!("type must be a secondary token");
        };
        assert_eq!(d.secondary(table, i), Some("type"));
    }

    #[test]
    fn reserved_indices_never_resolve() {
        let d = Dictionary::default();
        assert_eq!(d.primary(0), None);
        assert_eq!(d.primary(1), None);
        assert_eq!(d.primary(2), None);
    }

    #[test]
    fn unknown_string_has_no_token() {
        let d = Dictionary::default();
        assert_eq!(d.token_of("31000000000@s.whatsapp.net"), None);
    }

    #[test]
    fn primary_fits_single_byte_range() {
        assert!(PRIMARY.len() <= crate::DICT_FIRST as usize);
    }
}
