//! High-level events delivered by [`crate::EventStream`].
//!
//! Everything the server pushes is classified into one of the variants of
//! [`Event`], each carrying a named-field payload. Nodes with no dedicated
//! variant surface as [`Event::Raw`].

use chrono::{DateTime, Utc};
use waxmpp_codec::Node;

// ─── IncomingMessage ─────────────────────────────────────────────────────────

/// A received chat message, already acknowledged with a read receipt.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Sender JID (the group JID for group messages).
    pub from: String,
    /// Server-assigned stanza id.
    pub id: String,
    /// Unix timestamp from the `t` attribute.
    pub timestamp: u64,
    /// Sender's display name from the `notify` attribute.
    pub notify: Option<String>,
    /// For group messages: the participant who wrote it.
    pub author: Option<String>,
    /// The decoded content.
    pub kind: MessageKind,
}

/// Content of an [`IncomingMessage`].
#[derive(Clone, Debug)]
pub enum MessageKind {
    Text {
        body: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        url: Option<String>,
        /// Raw JPEG preview.
        thumbnail: Vec<u8>,
    },
    Image(MediaContent),
    Video(MediaContent),
    Audio(MediaContent),
    Vcard {
        name: String,
        /// Raw vCard bytes.
        vcard: Vec<u8>,
    },
}

/// Shared fields of image/video/audio messages.
#[derive(Clone, Debug, Default)]
pub struct MediaContent {
    pub url: String,
    pub size: u64,
    pub file: String,
    pub encoding: Option<String>,
    pub ip: Option<String>,
    pub mimetype: Option<String>,
    pub filehash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds, for audio/video.
    pub duration: Option<u32>,
    pub codecs: Option<String>,
    /// Raw JPEG preview (empty for audio).
    pub thumbnail: Vec<u8>,
    pub caption: Option<String>,
}

// ─── Typed payloads ──────────────────────────────────────────────────────────

/// Typing indicator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingState {
    Composing,
    Paused,
}

/// One entry of a status query reply.
#[derive(Clone, Debug)]
pub struct UserStatus {
    pub jid: String,
    pub status: String,
    /// When the status was set, if the server said.
    pub set_at: Option<DateTime<Utc>>,
}

/// Group metadata as returned by group queries.
#[derive(Clone, Debug, Default)]
pub struct GroupInfo {
    pub jid: String,
    pub owner: Option<String>,
    pub subject: Option<String>,
    pub creation: Option<u64>,
    pub participants: Vec<String>,
}

/// A group change pushed by the server.
#[derive(Clone, Debug)]
pub struct GroupNotification {
    pub group: String,
    pub kind: GroupChange,
}

#[derive(Clone, Debug)]
pub enum GroupChange {
    ParticipantsAdded { jids: Vec<String> },
    ParticipantsRemoved { jids: Vec<String> },
    SubjectChanged { subject: String, author: Option<String> },
    PictureChanged,
    Created { subject: Option<String> },
}

/// Contact sync outcome.
#[derive(Clone, Debug, Default)]
pub struct SyncResult {
    /// Numbers registered on the network, as JIDs.
    pub existing: Vec<String>,
    /// Numbers with no account.
    pub non_existing: Vec<String>,
    /// Inputs the server could not parse.
    pub invalid: Vec<String>,
}

/// Reply to a last-seen query.
#[derive(Clone, Debug)]
pub struct LastSeen {
    pub from: String,
    pub seconds_ago: u64,
    /// `now - seconds_ago`, for convenience.
    pub date: DateTime<Utc>,
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// A high-level event received from the server.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    /// The handshake completed; queued messages have been flushed.
    LoggedIn,
    /// The server refused the login. Terminal.
    LoginFailed { reason: String },
    /// The transport ended (after any reconnect attempts).
    Disconnected { reason: String },
    /// A chat message (the read receipt has already been sent).
    Message(IncomingMessage),
    /// A recipient's client confirmed delivery of one of our messages.
    MessageDelivered { from: String, id: String },
    /// The server acknowledged one of our stanzas.
    ServerAck { id: String, class: Option<String> },
    /// A contact's typing state changed (or was synthesized from a text).
    Typing {
        from: String,
        state: TypingState,
        author: Option<String>,
    },
    /// A contact's presence changed.
    Presence {
        from: String,
        available: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    /// An unsolicited last-seen reply.
    LastSeen(LastSeen),
    /// A group change notification (already acked).
    Group(GroupNotification),
    /// An unsolicited group query reply.
    GroupInfoReceived(GroupInfo),
    /// An unsolicited status query reply.
    StatusReceived { statuses: Vec<UserStatus> },
    /// A profile picture arrived.
    ProfilePicture {
        from: String,
        picture_id: Option<String>,
        data: Vec<u8>,
    },
    /// A media send failed. The session continues.
    MediaError { to: String, reason: String },
    /// A node with no dedicated variant.
    Raw(Node),
}
