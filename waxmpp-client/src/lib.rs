//! # waxmpp-client
//!
//! Async FunXMPP messenger client.
//!
//! ## Features
//! - Challenge/response login (`WAUTH-2`) with a persisted challenge for
//!   one-round-trip reconnects
//! - RC4-drop-768 + truncated HMAC-SHA1 framing negotiated per direction
//! - Text / location / vCard / media messages, one-to-one and group
//! - Delivery receipts, server acks, typing state, presence, last-seen
//! - Group management, contact sync, status, privacy, profile pictures
//! - Two-phase media upload with duplicate detection and thumbnails
//! - Optional Signal-style end-to-end encryption with pre-key fetch,
//!   publication, and replenishment
//! - Pre-login send queue, automatic reconnect, pluggable key store
//!
//! ## Example
//! ```rust,no_run
//! use waxmpp_client::{Client, Config, Event};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config {
//!     msisdn: "491234567890".into(),
//!     password: "base64-password-from-registration".into(),
//!     username: Some("Rusty".into()),
//!     ..Config::default()
//! };
//! let (client, mut events) = Client::connect(config).await?;
//! while let Some(event) = events.next().await {
//!     if let Event::Message(msg) = event {
//!         println!("{}: {:?}", msg.from, msg.kind);
//!         client.send_message(&msg.from, "pong")?;
//!     }
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod encryption;
mod errors;
mod factory;
mod handshake;
mod parse;
mod processor;
mod queue;
mod session;
mod tracker;

pub mod events;
pub mod jid;
pub mod keystore;
pub mod media;
pub mod transport;

pub use errors::{ClientError, RequestError};
pub use events::{
    Event, GroupChange, GroupInfo, GroupNotification, IncomingMessage, LastSeen, MediaContent,
    MessageKind, SyncResult, TypingState, UserStatus,
};
pub use keystore::{FileKeyStore, KeyStore, LocalIdentity, MemoryKeyStore};
#[cfg(feature = "sqlite-keystore")]
pub use keystore::SqliteKeyStore;
pub use media::{FixedThumbnailer, MediaStore, NullMediaStore, Thumbnailer, UploadedMedia};
pub use queue::MediaKind;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use waxmpp_codec::Node;

use session::{Command, RequestKind, SessionActor};
use transport::{SessionStream, Transport};

pub(crate) fn base64_engine() -> &'static base64::engine::general_purpose::GeneralPurpose {
    &base64::engine::general_purpose::STANDARD
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
///
/// `msisdn` and `password` are required for login; everything else has a
/// working default.
#[derive(Clone)]
pub struct Config {
    /// E.164 digits, no leading `+`.
    pub msisdn: String,
    /// Base64 password issued by the registration service.
    pub password: String,
    /// Display name carried in presence.
    pub username: Option<String>,
    /// Endpoint host to dial.
    pub host: String,
    /// Server host used inside stanzas.
    pub server: String,
    /// Group host used inside stanzas.
    pub group_server: String,
    pub port: u16,
    /// Reconnect automatically when the transport ends (default true).
    pub reconnect: bool,
    /// Device identifier in the stream resource.
    pub device_type: String,
    /// Client version in the stream resource and `av` attribute.
    pub app_version: String,
    /// User agent carried in the auth blob.
    pub user_agent: String,
    /// Mobile country code in the auth blob.
    pub mcc: String,
    /// Mobile network code in the auth blob.
    pub mnc: String,
    /// Where the last server nonce is persisted.
    pub challenge_file: PathBuf,
    /// Opaque registration-token blob (used by the external registration
    /// flow, carried here so all paths live in one place).
    pub magic_file: PathBuf,
    /// Identity / pre-key / session storage.
    pub key_store: Arc<dyn KeyStore>,
    /// HTTPS media transfer backend.
    pub media_store: Arc<dyn MediaStore>,
    /// Thumbnail generation backend.
    pub thumbnailer: Arc<dyn Thumbnailer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msisdn: String::new(),
            password: String::new(),
            username: None,
            host: "c.whatsapp.net".into(),
            server: jid::USER_SERVER.into(),
            group_server: jid::GROUP_SERVER.into(),
            port: 443,
            reconnect: true,
            device_type: "S40".into(),
            app_version: "2.12.96".into(),
            user_agent: "WhatsApp/2.12.96 S40Version/14.26 Device/Nokia302".into(),
            mcc: "001".into(),
            mnc: "001".into(),
            challenge_file: "waxmpp.challenge".into(),
            magic_file: "waxmpp.magic".into(),
            key_store: Arc::new(MemoryKeyStore::new()),
            media_store: Arc::new(NullMediaStore),
            thumbnailer: Arc::new(FixedThumbnailer),
        }
    }
}

// ─── EventStream ──────────────────────────────────────────────────────────────

/// Asynchronous stream of [`Event`]s.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event. `None` once the session has fully shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// Handle to a running session. Cheap to clone; all clones feed the same
/// session actor.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    server: String,
    group_server: String,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Dial the configured endpoint over TLS and start the session.
    ///
    /// Returns immediately after the transport connects; watch the
    /// [`EventStream`] for [`Event::LoggedIn`] / [`Event::LoginFailed`].
    pub async fn connect(config: Config) -> Result<(Self, EventStream), ClientError> {
        let transport = Transport::connect_tls(&config.host, config.port).await?;
        Ok(Self::start(config, transport, true))
    }

    /// Run the session over an already-connected stream (tests, tunnels).
    /// Reconnect is disabled: the caller owns the stream's lifecycle.
    pub fn connect_with_stream(
        config: Config,
        stream: impl SessionStream + 'static,
    ) -> (Self, EventStream) {
        Self::start(config, Transport::from_stream(stream), false)
    }

    fn start(config: Config, transport: Transport, can_reconnect: bool) -> (Self, EventStream) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let client = Self {
            commands: cmd_tx.clone(),
            server: config.server.clone(),
            group_server: config.group_server.clone(),
        };
        let actor = SessionActor::new(config, transport, event_tx, cmd_rx, cmd_tx, can_reconnect);
        tokio::spawn(actor.run());

        (client, EventStream { rx: event_rx })
    }

    /// Close the transport. Pending tracked requests resolve with
    /// [`ClientError::Disconnected`].
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands
            .send(cmd)
            .map_err(|_| ClientError::Disconnected)
    }

    async fn request(&self, kind: RequestKind) -> Result<Node, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Request { kind, tx })?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    // ── Messaging ──────────────────────────────────────────────────────────

    /// Send a plain text message. Queued if called before login.
    pub fn send_message(&self, to: &str, body: &str) -> Result<(), ClientError> {
        self.command(Command::SendText {
            to: jid::to_user_jid(to, &self.server),
            body: body.to_string(),
        })
    }

    /// Send a text message into a group.
    pub fn send_group_message(&self, group: &str, body: &str) -> Result<(), ClientError> {
        self.command(Command::SendText {
            to: jid::to_group_jid(group, &self.group_server),
            body: body.to_string(),
        })
    }

    /// Send a location pin.
    pub fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
    ) -> Result<(), ClientError> {
        self.command(Command::SendLocation {
            to: jid::to_user_jid(to, &self.server),
            latitude,
            longitude,
            name: name.map(str::to_string),
        })
    }

    /// Send a contact card.
    pub fn send_vcard(&self, to: &str, name: &str, vcard: Vec<u8>) -> Result<(), ClientError> {
        self.command(Command::SendVcard {
            to: jid::to_user_jid(to, &self.server),
            name: name.to_string(),
            vcard,
        })
    }

    /// Send an end-to-end encrypted text, fetching the recipient's pre-keys
    /// first if no session exists yet.
    pub fn send_encrypted_message(&self, to: &str, body: &str) -> Result<(), ClientError> {
        self.command(Command::SendEncrypted {
            to: jid::to_user_jid(to, &self.server),
            body: body.to_string(),
        })
    }

    /// Upload and send an image.
    pub fn send_image(
        &self,
        to: &str,
        path: impl Into<PathBuf>,
        caption: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send_media(to, path, MediaKind::Image, caption)
    }

    /// Upload and send a video.
    pub fn send_video(
        &self,
        to: &str,
        path: impl Into<PathBuf>,
        caption: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send_media(to, path, MediaKind::Video, caption)
    }

    /// Upload and send an audio clip.
    pub fn send_audio(&self, to: &str, path: impl Into<PathBuf>) -> Result<(), ClientError> {
        self.send_media(to, path, MediaKind::Audio, None)
    }

    fn send_media(
        &self,
        to: &str,
        path: impl Into<PathBuf>,
        kind: MediaKind,
        caption: Option<&str>,
    ) -> Result<(), ClientError> {
        self.command(Command::SendMedia {
            to: jid::to_user_jid(to, &self.server),
            path: path.into(),
            kind,
            caption: caption.map(str::to_string),
        })
    }

    /// Show "typing…" to the recipient.
    pub fn send_composing(&self, to: &str) -> Result<(), ClientError> {
        self.command(Command::SendChatState {
            to: jid::to_user_jid(to, &self.server),
            composing: true,
        })
    }

    /// Clear the typing indicator.
    pub fn send_paused(&self, to: &str) -> Result<(), ClientError> {
        self.command(Command::SendChatState {
            to: jid::to_user_jid(to, &self.server),
            composing: false,
        })
    }

    // ── Presence ───────────────────────────────────────────────────────────

    pub fn presence_available(&self) -> Result<(), ClientError> {
        self.command(Command::SetPresence { available: true })
    }

    pub fn presence_unavailable(&self) -> Result<(), ClientError> {
        self.command(Command::SetPresence { available: false })
    }

    /// Ask to be told about a contact's presence changes.
    pub fn presence_subscribe(&self, to: &str) -> Result<(), ClientError> {
        self.command(Command::PresenceSubscribe {
            to: jid::to_user_jid(to, &self.server),
        })
    }

    // ── Account ────────────────────────────────────────────────────────────

    /// When the contact was last seen online.
    pub async fn request_last_seen(&self, who: &str) -> Result<LastSeen, ClientError> {
        let who = jid::to_user_jid(who, &self.server);
        let reply = self.request(RequestKind::LastSeen { who }).await?;
        parse::last_seen(&reply).ok_or(ClientError::Request(RequestError {
            code: 0,
            text: "malformed last-seen reply".into(),
        }))
    }

    /// Round-trip a ping through the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(RequestKind::Ping).await.map(|_| ())
    }

    /// Set the account's status line.
    pub async fn set_status(&self, text: &str) -> Result<(), ClientError> {
        self.request(RequestKind::SetStatus {
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Fetch status lines for a set of contacts.
    pub async fn get_statuses(&self, whos: &[&str]) -> Result<Vec<UserStatus>, ClientError> {
        let whos = whos
            .iter()
            .map(|w| jid::to_user_jid(w, &self.server))
            .collect();
        let reply = self.request(RequestKind::GetStatuses { whos }).await?;
        Ok(parse::statuses(&reply))
    }

    /// Fetch a contact's profile picture.
    pub async fn get_profile_picture(
        &self,
        who: &str,
    ) -> Result<(Option<String>, Vec<u8>), ClientError> {
        let who = jid::to_user_jid(who, &self.server);
        let reply = self.request(RequestKind::GetProfilePicture { who }).await?;
        let picture = reply.child("picture");
        Ok((
            picture.and_then(|p| p.attribute("id")).map(str::to_string),
            picture
                .and_then(|p| p.data())
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
        ))
    }

    /// Replace the account's profile picture (square JPEG).
    pub async fn set_profile_picture(&self, jpeg: Vec<u8>) -> Result<(), ClientError> {
        self.request(RequestKind::SetProfilePicture { jpeg })
            .await
            .map(|_| ())
    }

    // ── Groups ─────────────────────────────────────────────────────────────

    /// Create a group and return its metadata.
    pub async fn create_group(
        &self,
        subject: &str,
        participants: &[&str],
    ) -> Result<GroupInfo, ClientError> {
        let participants = participants
            .iter()
            .map(|p| jid::to_user_jid(p, &self.server))
            .collect();
        let reply = self
            .request(RequestKind::CreateGroup {
                subject: subject.to_string(),
                participants,
            })
            .await?;
        Ok(reply
            .child("group")
            .map(parse::group_info)
            .unwrap_or_default())
    }

    /// Fetch one group's metadata.
    pub async fn group_info(&self, group: &str) -> Result<GroupInfo, ClientError> {
        let group = jid::to_group_jid(group, &self.group_server);
        let reply = self.request(RequestKind::GroupInfo { group }).await?;
        Ok(reply
            .child("group")
            .map(parse::group_info)
            .unwrap_or_default())
    }

    /// List the groups this account owns.
    pub async fn owning_groups(&self) -> Result<Vec<GroupInfo>, ClientError> {
        let reply = self.request(RequestKind::OwningGroups).await?;
        let groups = reply
            .child("groups")
            .map(|g| g.children().iter().map(parse::group_info).collect())
            .unwrap_or_default();
        Ok(groups)
    }

    pub async fn add_group_participants(
        &self,
        group: &str,
        jids: &[&str],
    ) -> Result<(), ClientError> {
        let group = jid::to_group_jid(group, &self.group_server);
        let jids = jids.iter().map(|j| jid::to_user_jid(j, &self.server)).collect();
        self.request(RequestKind::AddParticipants { group, jids })
            .await
            .map(|_| ())
    }

    pub async fn remove_group_participants(
        &self,
        group: &str,
        jids: &[&str],
    ) -> Result<(), ClientError> {
        let group = jid::to_group_jid(group, &self.group_server);
        let jids = jids.iter().map(|j| jid::to_user_jid(j, &self.server)).collect();
        self.request(RequestKind::RemoveParticipants { group, jids })
            .await
            .map(|_| ())
    }

    pub async fn leave_group(&self, group: &str) -> Result<(), ClientError> {
        let group = jid::to_group_jid(group, &self.group_server);
        self.request(RequestKind::LeaveGroup { group }).await.map(|_| ())
    }

    pub async fn set_group_subject(&self, group: &str, subject: &str) -> Result<(), ClientError> {
        let group = jid::to_group_jid(group, &self.group_server);
        self.request(RequestKind::SetGroupSubject {
            group,
            subject: subject.to_string(),
        })
        .await
        .map(|_| ())
    }

    // ── Contacts / privacy / service ───────────────────────────────────────

    /// Ask the server which of `numbers` are registered accounts.
    pub async fn sync_contacts(&self, numbers: &[&str]) -> Result<SyncResult, ClientError> {
        let numbers = numbers.iter().map(|n| n.to_string()).collect();
        let reply = self.request(RequestKind::SyncContacts { numbers }).await?;
        Ok(parse::sync_result(&reply))
    }

    pub async fn get_privacy_settings(&self) -> Result<Vec<(String, String)>, ClientError> {
        let reply = self.request(RequestKind::GetPrivacySettings).await?;
        let query = reply.child("query").cloned().unwrap_or_else(|| Node::new("query"));
        Ok(parse::named_pairs(&query, "list", "item"))
    }

    pub async fn set_privacy_setting(&self, name: &str, value: &str) -> Result<(), ClientError> {
        self.request(RequestKind::SetPrivacySettings {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Server-side feature flags.
    pub async fn get_properties(&self) -> Result<Vec<(String, String)>, ClientError> {
        let reply = self.request(RequestKind::GetProperties).await?;
        Ok(parse::named_pairs(&reply, "props", "prop"))
    }

    /// Subscription pricing for this account's region.
    pub async fn get_pricing(&self) -> Result<Vec<(String, String)>, ClientError> {
        let reply = self.request(RequestKind::GetPricing).await?;
        Ok(reply
            .child("pricing")
            .map(|p| {
                p.attributes()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Extend the account's paid period.
    pub async fn extend_account(&self) -> Result<(), ClientError> {
        self.request(RequestKind::ExtendAccount).await.map(|_| ())
    }
}
