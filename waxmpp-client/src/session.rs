//! The session actor: one task owning the transport, the codec, and every
//! piece of mutable session state.
//!
//! Public API methods talk to it over a command channel; everything the
//! server pushes comes back out as [`Event`]s. A received frame is always
//! processed to completion, including the acknowledgements it triggers,
//! before the next frame is read, so receipts and acks can never overtake
//! the emission they belong to.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use waxmpp_codec::{Node, Reader, Writer};
use waxmpp_crypto::{derive_keys, KeyStream};

use crate::encryption::{EncryptOutcome, EncryptionBridge};
use crate::errors::{ClientError, RequestError};
use crate::events::{Event, GroupChange, GroupNotification, TypingState};
use crate::factory::NodeFactory;
use crate::handshake;
use crate::media::{MediaStore, Thumbnailer, UploadedMedia};
use crate::processor::MessageProcessor;
use crate::queue::{MediaKind, MediaRequestQueue, PendingMedia, SendQueue};
use crate::tracker::RequestTracker;
use crate::transport::Transport;
use crate::{base64_engine, Config};

use base64::Engine;

/// Seconds between keep-alive pings once logged in.
const PING_INTERVAL: u64 = 60;

pub(crate) type Completion = oneshot::Sender<Result<Node, ClientError>>;

// ─── Commands ────────────────────────────────────────────────────────────────

/// What the public API asks the actor to do.
pub(crate) enum Command {
    SendText {
        to: String,
        body: String,
    },
    SendLocation {
        to: String,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    SendVcard {
        to: String,
        name: String,
        vcard: Vec<u8>,
    },
    SendEncrypted {
        to: String,
        body: String,
    },
    SendMedia {
        to: String,
        path: std::path::PathBuf,
        kind: MediaKind,
        caption: Option<String>,
    },
    SendChatState {
        to: String,
        composing: bool,
    },
    SetPresence {
        available: bool,
    },
    PresenceSubscribe {
        to: String,
    },
    Request {
        kind: RequestKind,
        tx: Completion,
    },
    /// Internal: an off-task upload finished.
    MediaFinish {
        to: String,
        path: std::path::PathBuf,
        kind: MediaKind,
        caption: Option<String>,
        result: Result<UploadedMedia, ClientError>,
    },
    Disconnect,
}

/// Tracked `iq` requests the API can issue.
pub(crate) enum RequestKind {
    LastSeen { who: String },
    Ping,
    SetStatus { text: String },
    GetStatuses { whos: Vec<String> },
    GetProfilePicture { who: String },
    SetProfilePicture { jpeg: Vec<u8> },
    CreateGroup { subject: String, participants: Vec<String> },
    GroupInfo { group: String },
    OwningGroups,
    AddParticipants { group: String, jids: Vec<String> },
    RemoveParticipants { group: String, jids: Vec<String> },
    LeaveGroup { group: String },
    SetGroupSubject { group: String, subject: String },
    SyncContacts { numbers: Vec<String> },
    GetPrivacySettings,
    SetPrivacySettings { name: String, value: String },
    GetProperties,
    GetPricing,
    ExtendAccount,
}

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    AwaitingChallengeOrSuccess,
    AwaitingSuccess,
    LoggedIn,
    Failed,
}

/// Why a connection run ended.
enum ConnectionEnd {
    /// `disconnect()` was called or every handle dropped.
    Requested,
}

pub(crate) struct SessionActor {
    config: Config,
    transport: Transport,
    reader: Reader,
    writer: Writer,
    state: SessionState,
    factory: NodeFactory,
    tracker: RequestTracker,
    send_queue: SendQueue,
    media_queue: MediaRequestQueue,
    processor: MessageProcessor,
    bridge: EncryptionBridge,
    events: mpsc::UnboundedSender<Event>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Loop-back sender for off-task work (media uploads).
    feedback: mpsc::UnboundedSender<Command>,
    /// Writer keystream parked until `success` arrives.
    pending_writer_key: Option<KeyStream>,
    /// Encrypted sends issued before login, replayed after.
    deferred: Vec<Command>,
    self_jid: String,
    /// `false` when running over an injected stream (tests, tunnels).
    can_reconnect: bool,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        transport: Transport,
        events: mpsc::UnboundedSender<Event>,
        commands: mpsc::UnboundedReceiver<Command>,
        feedback: mpsc::UnboundedSender<Command>,
        can_reconnect: bool,
    ) -> Self {
        let factory = NodeFactory::new(config.server.clone(), config.app_version.clone());
        let self_jid = format!("{}@{}", config.msisdn, config.server);
        Self {
            config,
            transport,
            reader: Reader::new(),
            writer: Writer::new(),
            state: SessionState::AwaitingChallengeOrSuccess,
            factory,
            tracker: RequestTracker::default(),
            send_queue: SendQueue::default(),
            media_queue: MediaRequestQueue::default(),
            processor: MessageProcessor::new(),
            bridge: EncryptionBridge::new(),
            events,
            commands,
            feedback,
            pending_writer_key: None,
            deferred: Vec::new(),
            self_jid,
            can_reconnect,
        }
    }

    // ── Top level ──────────────────────────────────────────────────────────

    pub async fn run(mut self) {
        loop {
            let outcome = self.run_connection().await;
            self.tracker.fail_all();

            match outcome {
                Ok(ConnectionEnd::Requested) => {
                    self.emit(Event::Disconnected {
                        reason: "disconnect requested".into(),
                    });
                    return;
                }
                Err(ClientError::Transport(e))
                    if self.config.reconnect
                        && self.can_reconnect
                        && self.state != SessionState::Failed =>
                {
                    tracing::warn!(error = %e, "transport ended, reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    match Transport::connect_tls(&self.config.host, self.config.port).await {
                        Ok(transport) => {
                            self.transport = transport;
                            self.reader = Reader::new();
                            self.writer = Writer::new();
                            self.pending_writer_key = None;
                            self.state = SessionState::AwaitingChallengeOrSuccess;
                            continue;
                        }
                        Err(e) => {
                            self.emit(Event::Disconnected {
                                reason: format!("reconnect failed: {e}"),
                            });
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.emit(Event::Disconnected {
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn run_connection(&mut self) -> Result<ConnectionEnd, ClientError> {
        self.start_handshake().await?;

        let mut ping = tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.reset();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        None | Some(Command::Disconnect) => return Ok(ConnectionEnd::Requested),
                        Some(cmd) => self.handle_command(cmd).await?,
                    }
                }
                received = self.transport.recv() => {
                    let data = received?;
                    if data.is_empty() {
                        return Err(ClientError::Transport(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed by server",
                        )));
                    }
                    self.reader.feed(&data);
                    // Each frame runs to completion before the next is read.
                    while let Some(node) = self.reader.next_node()? {
                        self.handle_node(node).await?;
                    }
                }
                _ = ping.tick() => {
                    if self.state == SessionState::LoggedIn {
                        let (mut iq, _) = self.factory.iq("get", "w:p", None);
                        iq.push_child(Node::new("ping"));
                        self.send_node(&iq).await?;
                    }
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn send_node(&mut self, node: &Node) -> Result<(), ClientError> {
        let frame = self.writer.node(node)?;
        self.transport.send(&frame).await?;
        Ok(())
    }

    fn logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    // ── Handshake ──────────────────────────────────────────────────────────

    async fn start_handshake(&mut self) -> Result<(), ClientError> {
        let resource = format!(
            "{}-{}-{}",
            self.config.device_type, self.config.app_version, self.config.port
        );
        let hello = self.writer.start_stream(&self.config.server, &resource);
        self.transport.send(&hello).await?;

        self.send_node(&handshake::features_node()).await?;

        // A persisted challenge enables one-round-trip login: the auth node
        // already carries the authenticated blob.
        let blob = match handshake::load_challenge(&self.config.challenge_file) {
            Some(nonce) => Some(self.negotiate_keys(&nonce)?),
            None => None,
        };
        self.send_node(&handshake::auth_node(&self.config.msisdn.clone(), blob))
            .await?;
        self.state = SessionState::AwaitingChallengeOrSuccess;
        Ok(())
    }

    /// Derive the four session keys from `nonce`, install the reader
    /// keystream, park the writer keystream until `success`, and return the
    /// authenticated blob.
    fn negotiate_keys(&mut self, nonce: &[u8]) -> Result<Vec<u8>, ClientError> {
        let keys =
            derive_keys(&self.config.password, nonce).map_err(|_| ClientError::KeyDerivation)?;
        let mut writer_key = KeyStream::new(keys[0], keys[1]);
        let blob = handshake::auth_blob(&self.config, nonce, &mut writer_key);
        self.reader.set_keystream(KeyStream::new(keys[2], keys[3]));
        self.pending_writer_key = Some(writer_key);
        Ok(blob)
    }

    async fn on_challenge(&mut self, node: &Node) -> Result<(), ClientError> {
        let nonce = node.data().unwrap_or_default().to_vec();
        let blob = self.negotiate_keys(&nonce)?;
        self.send_node(&handshake::response_node(blob)).await?;
        self.state = SessionState::AwaitingSuccess;
        Ok(())
    }

    async fn on_success(&mut self, node: &Node) -> Result<(), ClientError> {
        // Persist the fresh nonce before advancing: a crash after this
        // point must not strand a challenge file the server won't accept.
        if let Some(nonce) = node.data() {
            if let Err(e) = handshake::persist_challenge(&self.config.challenge_file, nonce) {
                tracing::warn!(error = %e, "could not persist challenge");
            }
        }
        if let Some(writer_key) = self.pending_writer_key.take() {
            self.writer.set_keystream(writer_key);
        }
        self.state = SessionState::LoggedIn;
        tracing::info!(jid = %self.self_jid, "logged in");
        self.emit(Event::LoggedIn);

        if self.config.username.is_some() {
            let presence = self.presence_node(true);
            self.send_node(&presence).await?;
        }

        // Flush everything composed before login, in submission order.
        for node in self.send_queue.drain() {
            self.send_node(&node).await?;
        }

        // First login after registration publishes fresh pre-keys.
        let store = Arc::clone(&self.config.key_store);
        match self
            .bridge
            .ensure_initialized(&*store, &mut self.factory)
            .await
        {
            Ok(Some(publish)) => self.send_node(&publish).await?,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "pre-key publication failed"),
        }

        for cmd in std::mem::take(&mut self.deferred) {
            self.handle_command(cmd).await?;
        }
        Ok(())
    }

    fn on_failure(&mut self, node: &Node) -> Result<(), ClientError> {
        let reason = handshake::failure_reason(node);
        self.state = SessionState::Failed;
        self.emit(Event::LoginFailed {
            reason: reason.clone(),
        });
        Err(ClientError::Auth(reason))
    }

    // ── Node dispatch ──────────────────────────────────────────────────────

    async fn handle_node(&mut self, node: Node) -> Result<(), ClientError> {
        match self.state {
            SessionState::AwaitingChallengeOrSuccess | SessionState::AwaitingSuccess => {
                match node.tag() {
                    "challenge" => self.on_challenge(&node).await,
                    "success" => self.on_success(&node).await,
                    "failure" => self.on_failure(&node),
                    // The server's stream header and features are informational.
                    "start" | "stream:features" => Ok(()),
                    _ => Ok(()),
                }
            }
            SessionState::LoggedIn => self.handle_logged_in(node).await,
            SessionState::Failed => Ok(()),
        }
    }

    async fn handle_logged_in(&mut self, node: Node) -> Result<(), ClientError> {
        match node.tag() {
            "iq" => self.handle_iq(node).await,
            "message" => self.handle_message(node).await,
            "notification" => self.handle_notification(node).await,
            "receipt" => self.handle_receipt(node).await,
            "ack" => {
                let id = node.attribute("id").unwrap_or_default().to_string();
                if !self.tracker.resolve(&id, node.clone()) {
                    self.emit(Event::ServerAck {
                        id,
                        class: node.attribute("class").map(str::to_string),
                    });
                }
                Ok(())
            }
            "presence" => {
                let from = node.attribute("from").unwrap_or_default().to_string();
                if from != self.self_jid {
                    let last_seen = node
                        .attribute("last")
                        .and_then(|t| t.parse::<i64>().ok())
                        .and_then(|t| Utc.timestamp_opt(t, 0).single());
                    self.emit(Event::Presence {
                        from,
                        available: node.attribute("type") != Some("unavailable"),
                        last_seen,
                    });
                }
                Ok(())
            }
            "chatstate" => {
                let from = node.attribute("from").unwrap_or_default().to_string();
                let state = match node.children().first().map(Node::tag) {
                    Some("composing") => TypingState::Composing,
                    _ => TypingState::Paused,
                };
                self.emit(Event::Typing {
                    from,
                    state,
                    author: node.attribute("participant").map(str::to_string),
                });
                Ok(())
            }
            "ib" => self.handle_ib(node).await,
            _ => {
                self.emit(Event::Raw(node));
                Ok(())
            }
        }
    }

    async fn handle_ib(&mut self, node: Node) -> Result<(), ClientError> {
        if node.has_child("ping") {
            let pong = Node::new("iq")
                .with_attribute("to", self.config.server.clone())
                .with_attribute("id", node.attribute("id").unwrap_or_default())
                .with_attribute("type", "result");
            return self.send_node(&pong).await;
        }
        if let Some(dirty) = node.child("dirty") {
            let kind = dirty.attribute("type").unwrap_or("groups").to_string();
            let (mut clean, _) = self
                .factory
                .iq("set", "urn:xmpp:whatsapp:dirty", None);
            clean.push_child(Node::new("clean").with_attribute("type", kind));
            return self.send_node(&clean).await;
        }
        Ok(())
    }

    // ── iq dispatch ────────────────────────────────────────────────────────

    async fn handle_iq(&mut self, node: Node) -> Result<(), ClientError> {
        let id = node.attribute("id").unwrap_or_default().to_string();

        if let Some(error) = node.child("error") {
            let request_error = RequestError {
                code: error
                    .attribute("code")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0),
                text: error
                    .children()
                    .first()
                    .map(|c| c.tag().to_string())
                    .or_else(|| error.attribute("text").map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string()),
            };

            if let Some(pending) = self.media_queue.take(&id) {
                self.emit(Event::MediaError {
                    to: pending.to,
                    reason: request_error.to_string(),
                });
            } else if self.bridge.is_fetch(&id) {
                // Treat a failed fetch like an empty reply: queued messages
                // for those JIDs go out unencrypted.
                self.drain_fetch_reply(&node).await?;
            } else if !self.tracker.fail(&id, ClientError::Request(request_error)) {
                self.emit(Event::Raw(node));
            }
            return Ok(());
        }

        if self.media_queue.contains(&id) {
            return self.handle_media_slot(node, id).await;
        }
        if self.bridge.is_fetch(&id) {
            return self.drain_fetch_reply(&node).await;
        }
        if self.tracker.is_tracked(&id) {
            self.tracker.resolve(&id, node);
            return Ok(());
        }

        // Untracked replies by shape.
        if let Some(query) = node.child("query") {
            if let Some(seconds) = query.attribute("seconds").and_then(|s| s.parse().ok()) {
                let from = node.attribute("from").unwrap_or_default().to_string();
                self.emit(Event::LastSeen(crate::events::LastSeen {
                    from,
                    seconds_ago: seconds,
                    date: Utc::now() - chrono::Duration::seconds(seconds as i64),
                }));
                return Ok(());
            }
        }
        if let Some(picture) = node.child("picture") {
            self.emit(Event::ProfilePicture {
                from: node.attribute("from").unwrap_or_default().to_string(),
                picture_id: picture.attribute("id").map(str::to_string),
                data: picture.data().map(<[u8]>::to_vec).unwrap_or_default(),
            });
            return Ok(());
        }
        if node.has_child("status") {
            self.emit(Event::StatusReceived {
                statuses: crate::parse::statuses(&node),
            });
            return Ok(());
        }
        if let Some(group) = node.child("group") {
            self.emit(Event::GroupInfoReceived(crate::parse::group_info(group)));
            return Ok(());
        }
        if let Some(groups) = node.child("groups") {
            for group in groups.children() {
                self.emit(Event::GroupInfoReceived(crate::parse::group_info(group)));
            }
            return Ok(());
        }

        self.emit(Event::Raw(node));
        Ok(())
    }

    async fn drain_fetch_reply(&mut self, node: &Node) -> Result<(), ClientError> {
        let store = Arc::clone(&self.config.key_store);
        let out = self
            .bridge
            .handle_fetch_reply(&*store, node, &mut self.factory)
            .await?;
        for message in out {
            self.send_node(&message).await?;
        }
        Ok(())
    }

    // ── message / notification / receipt ───────────────────────────────────

    async fn handle_message(&mut self, node: Node) -> Result<(), ClientError> {
        let from = node.attribute("from").unwrap_or_default().to_string();
        let id = node.attribute("id").unwrap_or_default().to_string();
        let has_content =
            node.has_child("body") || node.has_child("media") || node.has_child("enc");

        // The receipt goes out before anything user-visible happens.
        if has_content && from != self.self_jid && !from.is_empty() {
            let mut receipt = Node::new("receipt")
                .with_attribute("to", from.clone())
                .with_attribute("id", id.clone())
                .with_attribute("type", "read")
                .with_attribute("t", NodeFactory::timestamp());
            if let Some(participant) = node.attribute("participant") {
                receipt.set_attribute("participant", participant);
            }
            self.send_node(&receipt).await?;
        }

        let node = if node.has_child("enc") {
            let store = Arc::clone(&self.config.key_store);
            match self.bridge.decrypt_message(&*store, &node).await {
                Ok(Some(plain)) => plain,
                Ok(None) => node,
                Err(e) => {
                    // Undecryptable messages are dropped, not fatal.
                    tracing::warn!(from = %from, id = %id, error = %e, "dropping undecryptable message");
                    return Ok(());
                }
            }
        } else {
            node
        };

        // A finished text implies the sender stopped typing.
        if node.attribute("type") == Some("text") && node.has_child("body") {
            self.emit(Event::Typing {
                from: from.clone(),
                state: TypingState::Paused,
                author: node.attribute("participant").map(str::to_string),
            });
        }

        if let Some(message) = self.processor.process(&node) {
            self.emit(Event::Message(message));
        }
        Ok(())
    }

    async fn handle_notification(&mut self, node: Node) -> Result<(), ClientError> {
        let from = node.attribute("from").unwrap_or_default().to_string();
        let id = node.attribute("id").unwrap_or_default().to_string();

        // Mirror id/type/participant back before any emission.
        let mut ack = Node::new("ack")
            .with_attribute("to", from.clone())
            .with_attribute("class", "notification")
            .with_attribute("id", id);
        if let Some(kind) = node.attribute("type") {
            ack.set_attribute("type", kind);
        }
        if let Some(participant) = node.attribute("participant") {
            ack.set_attribute("participant", participant);
        }
        self.send_node(&ack).await?;

        if node.attribute("type") == Some("encrypt") {
            let remaining = node
                .child("count")
                .and_then(|c| c.attribute("value"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let store = Arc::clone(&self.config.key_store);
            match self
                .bridge
                .replenish(&*store, remaining, &mut self.factory)
                .await
            {
                Ok(Some(publish)) => self.send_node(&publish).await?,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "pre-key replenishment failed"),
            }
            return Ok(());
        }

        let jids = |container: &Node| -> Vec<String> {
            container
                .children()
                .iter()
                .filter_map(|p| p.attribute("jid").map(str::to_string))
                .collect()
        };

        let change = if let Some(add) = node.child("add") {
            Some(GroupChange::ParticipantsAdded { jids: jids(add) })
        } else if let Some(remove) = node.child("remove") {
            Some(GroupChange::ParticipantsRemoved { jids: jids(remove) })
        } else if let Some(subject) = node.child("subject") {
            Some(GroupChange::SubjectChanged {
                subject: subject
                    .attribute("subject")
                    .map(str::to_string)
                    .or_else(|| subject.data_string())
                    .unwrap_or_default(),
                author: node.attribute("participant").map(str::to_string),
            })
        } else if node.has_child("picture") {
            Some(GroupChange::PictureChanged)
        } else if let Some(create) = node.child("create") {
            Some(GroupChange::Created {
                subject: create
                    .child("group")
                    .and_then(|g| g.attribute("subject"))
                    .map(str::to_string),
            })
        } else {
            None
        };

        match change {
            Some(kind) => self.emit(Event::Group(GroupNotification { group: from, kind })),
            None => self.emit(Event::Raw(node)),
        }
        Ok(())
    }

    async fn handle_receipt(&mut self, node: Node) -> Result<(), ClientError> {
        let from = node.attribute("from").unwrap_or_default().to_string();
        let id = node.attribute("id").unwrap_or_default().to_string();

        let ack = Node::new("ack")
            .with_attribute("to", from.clone())
            .with_attribute("class", "receipt")
            .with_attribute("id", id.clone())
            .with_attribute("t", NodeFactory::timestamp());
        self.send_node(&ack).await?;

        self.emit(Event::MessageDelivered {
            from: from.clone(),
            id,
        });
        // A receipt can confirm several earlier messages at once.
        if let Some(list) = node.child("list") {
            for item in list.children() {
                if let Some(extra) = item.attribute("id") {
                    self.emit(Event::MessageDelivered {
                        from: from.clone(),
                        id: extra.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Result<(), ClientError> {
        match cmd {
            Command::SendText { to, body } => {
                let node = self.factory.text_message(&to, body.as_bytes());
                self.send_or_queue(node).await
            }
            Command::SendLocation {
                to,
                latitude,
                longitude,
                name,
            } => {
                let mut media = Node::new("media")
                    .with_attribute("type", "location")
                    .with_attribute("latitude", latitude.to_string())
                    .with_attribute("longitude", longitude.to_string());
                if let Some(name) = name {
                    media.set_attribute("name", name);
                }
                let node = self.factory.message(&to, "media").with_child(media);
                self.send_or_queue(node).await
            }
            Command::SendVcard { to, name, vcard } => {
                let media = Node::new("media").with_attribute("type", "vcard").with_child(
                    Node::new("vcard")
                        .with_attribute("name", name)
                        .with_data(vcard),
                );
                let node = self.factory.message(&to, "media").with_child(media);
                self.send_or_queue(node).await
            }
            Command::SendEncrypted { to, body } => {
                if !self.logged_in() {
                    self.deferred.push(Command::SendEncrypted { to, body });
                    return Ok(());
                }
                let store = Arc::clone(&self.config.key_store);
                match self
                    .bridge
                    .send_encrypted(&*store, &to, &body, &mut self.factory)
                    .await?
                {
                    EncryptOutcome::Send(node) => self.send_node(&node).await,
                    EncryptOutcome::Fetch(iq) => self.send_node(&iq).await,
                    EncryptOutcome::Queued => Ok(()),
                }
            }
            Command::SendMedia {
                to,
                path,
                kind,
                caption,
            } => self.start_media_send(to, path, kind, caption).await,
            Command::SendChatState { to, composing } => {
                if !self.logged_in() {
                    return Ok(());
                }
                let state = if composing { "composing" } else { "paused" };
                let node = Node::new("chatstate")
                    .with_attribute("to", to)
                    .with_child(Node::new(state));
                self.send_node(&node).await
            }
            Command::SetPresence { available } => {
                let node = self.presence_node(available);
                if self.logged_in() {
                    self.send_node(&node).await
                } else {
                    Ok(())
                }
            }
            Command::PresenceSubscribe { to } => {
                if !self.logged_in() {
                    return Ok(());
                }
                let node = Node::new("presence")
                    .with_attribute("type", "subscribe")
                    .with_attribute("to", to);
                self.send_node(&node).await
            }
            Command::Request { kind, tx } => {
                if !self.logged_in() {
                    let _ = tx.send(Err(ClientError::NotLoggedIn));
                    return Ok(());
                }
                let (node, id) = self.build_request(&kind);
                self.tracker.register(&id, tx);
                self.send_node(&node).await
            }
            Command::MediaFinish {
                to,
                path,
                kind,
                caption,
                result,
            } => match result {
                Ok(uploaded) => {
                    let node = self.media_message(&to, &path, kind, caption, &uploaded)?;
                    self.send_node(&node).await
                }
                Err(e) => {
                    self.emit(Event::MediaError {
                        to,
                        reason: e.to_string(),
                    });
                    Ok(())
                }
            },
            Command::Disconnect => Ok(()), // handled by the select loop
        }
    }

    async fn send_or_queue(&mut self, node: Node) -> Result<(), ClientError> {
        if self.logged_in() {
            self.send_node(&node).await
        } else {
            tracing::debug!(queued = self.send_queue.len() + 1, "queueing pre-login send");
            self.send_queue.push(node);
            Ok(())
        }
    }

    fn presence_node(&self, available: bool) -> Node {
        let mut node = Node::new("presence");
        if available {
            if let Some(username) = &self.config.username {
                node.set_attribute("name", username.clone());
            }
        } else {
            node.set_attribute("type", "unavailable");
        }
        node
    }

    // ── Media ──────────────────────────────────────────────────────────────

    async fn start_media_send(
        &mut self,
        to: String,
        path: std::path::PathBuf,
        kind: MediaKind,
        caption: Option<String>,
    ) -> Result<(), ClientError> {
        if !self.logged_in() {
            self.emit(Event::MediaError {
                to,
                reason: "not logged in".into(),
            });
            return Ok(());
        }
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) => {
                self.emit(Event::MediaError {
                    to,
                    reason: format!("cannot read {}: {e}", path.display()),
                });
                return Ok(());
            }
        };
        let size = contents.len() as u64;
        let hash = base64_engine().encode(Sha256::digest(&contents));

        let (mut iq, id) = self.factory.iq("set", "w:m", None);
        iq.push_child(
            Node::new("media")
                .with_attribute("hash", hash)
                .with_attribute("type", kind.as_str())
                .with_attribute("size", size.to_string()),
        );
        self.media_queue.insert(
            &id,
            PendingMedia {
                to,
                path,
                size,
                kind,
                caption,
            },
        );
        self.send_node(&iq).await
    }

    /// The upload-slot reply arrived: either the server already has the
    /// content (`duplicate`) or it allocated an upload URL (`media`).
    async fn handle_media_slot(&mut self, node: Node, id: String) -> Result<(), ClientError> {
        let Some(pending) = self.media_queue.take(&id) else {
            return Ok(());
        };

        if let Some(duplicate) = node.child("duplicate") {
            let uploaded = UploadedMedia {
                url: duplicate.attribute("url").unwrap_or_default().to_string(),
                media_type: pending.kind.as_str().to_string(),
                size: duplicate
                    .attribute("size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(pending.size),
                name: file_name(&pending.path),
            };
            let message =
                self.media_message(&pending.to, &pending.path, pending.kind, pending.caption, &uploaded)?;
            return self.send_node(&message).await;
        }

        if let Some(media) = node.child("media") {
            let url = media.attribute("url").unwrap_or_default().to_string();
            let store = Arc::clone(&self.config.media_store);
            let feedback = self.feedback.clone();
            let from = self.config.msisdn.clone();
            tokio::spawn(async move {
                let result = store
                    .upload(&pending.path, &url, pending.kind.as_str(), &from, &pending.to)
                    .await;
                let _ = feedback.send(Command::MediaFinish {
                    to: pending.to,
                    path: pending.path,
                    kind: pending.kind,
                    caption: pending.caption,
                    result,
                });
            });
            return Ok(());
        }

        self.emit(Event::MediaError {
            to: pending.to,
            reason: "upload slot reply carried neither media nor duplicate".into(),
        });
        Ok(())
    }

    fn media_message(
        &mut self,
        to: &str,
        path: &std::path::Path,
        kind: MediaKind,
        caption: Option<String>,
        uploaded: &UploadedMedia,
    ) -> Result<Node, ClientError> {
        let mut media = Node::new("media")
            .with_attribute("type", kind.as_str())
            .with_attribute("url", uploaded.url.clone())
            .with_attribute("size", uploaded.size.to_string())
            .with_attribute("file", uploaded.name.clone());
        if let Some(mime) = mime_guess::from_path(path).first() {
            media.set_attribute("mimetype", mime.essence_str());
        }
        if let Some(caption) = caption {
            media.set_attribute("caption", caption);
        }

        let thumbnail = match kind {
            MediaKind::Image => Some(self.config.thumbnailer.image_thumbnail(path)),
            MediaKind::Video => Some(self.config.thumbnailer.video_thumbnail(path)),
            MediaKind::Audio => None,
        };
        match thumbnail {
            Some(Ok(jpeg)) => media.set_data(jpeg),
            Some(Err(e)) => tracing::warn!(error = %e, "thumbnail generation failed"),
            None => {}
        }

        Ok(self.factory.message(to, "media").with_child(media))
    }

    // ── Request building ───────────────────────────────────────────────────

    fn build_request(&mut self, kind: &RequestKind) -> (Node, String) {
        let group_server = self.config.group_server.clone();
        match kind {
            RequestKind::LastSeen { who } => {
                let (mut iq, id) = self.factory.iq("get", "jabber:iq:last", Some(who.as_str()));
                iq.push_child(Node::new("query"));
                (iq, id)
            }
            RequestKind::Ping => {
                let (mut iq, id) = self.factory.iq("get", "w:p", None);
                iq.push_child(Node::new("ping"));
                (iq, id)
            }
            RequestKind::SetStatus { text } => {
                let (mut iq, id) = self.factory.iq("set", "status", None);
                iq.push_child(Node::new("status").with_data(text.as_bytes()));
                (iq, id)
            }
            RequestKind::GetStatuses { whos } => {
                let (mut iq, id) = self.factory.iq("get", "status", None);
                let mut status = Node::new("status");
                for who in whos {
                    status.push_child(Node::new("user").with_attribute("jid", who.clone()));
                }
                iq.push_child(status);
                (iq, id)
            }
            RequestKind::GetProfilePicture { who } => {
                let (mut iq, id) = self.factory.iq("get", "w:profile:picture", Some(who.as_str()));
                iq.push_child(Node::new("picture").with_attribute("type", "image"));
                (iq, id)
            }
            RequestKind::SetProfilePicture { jpeg } => {
                let self_jid = self.self_jid.clone();
                let (mut iq, id) = self
                    .factory
                    .iq("set", "w:profile:picture", Some(self_jid.as_str()));
                iq.push_child(Node::new("picture").with_data(jpeg.clone()));
                (iq, id)
            }
            RequestKind::CreateGroup {
                subject,
                participants,
            } => {
                let (mut iq, id) = self.factory.iq("set", "w:g2", Some(group_server.as_str()));
                let mut create = Node::new("create").with_attribute("subject", subject.clone());
                for jid in participants {
                    create.push_child(Node::new("participant").with_attribute("jid", jid.clone()));
                }
                iq.push_child(create);
                (iq, id)
            }
            RequestKind::GroupInfo { group } => {
                let (mut iq, id) = self.factory.iq("get", "w:g2", Some(group.as_str()));
                iq.push_child(Node::new("query"));
                (iq, id)
            }
            RequestKind::OwningGroups => {
                let (mut iq, id) = self.factory.iq("get", "w:g2", Some(group_server.as_str()));
                iq.push_child(Node::new("groups").with_attribute("type", "owning"));
                (iq, id)
            }
            RequestKind::AddParticipants { group, jids } => {
                let (mut iq, id) = self.factory.iq("set", "w:g2", Some(group.as_str()));
                let mut add = Node::new("add");
                for jid in jids {
                    add.push_child(Node::new("participant").with_attribute("jid", jid.clone()));
                }
                iq.push_child(add);
                (iq, id)
            }
            RequestKind::RemoveParticipants { group, jids } => {
                let (mut iq, id) = self.factory.iq("set", "w:g2", Some(group.as_str()));
                let mut remove = Node::new("remove");
                for jid in jids {
                    remove.push_child(Node::new("participant").with_attribute("jid", jid.clone()));
                }
                iq.push_child(remove);
                (iq, id)
            }
            RequestKind::LeaveGroup { group } => {
                let (mut iq, id) = self.factory.iq("set", "w:g2", Some(group_server.as_str()));
                iq.push_child(
                    Node::new("leave")
                        .with_child(Node::new("group").with_attribute("id", group.clone())),
                );
                (iq, id)
            }
            RequestKind::SetGroupSubject { group, subject } => {
                let (mut iq, id) = self.factory.iq("set", "w:g2", Some(group.as_str()));
                iq.push_child(Node::new("subject").with_data(subject.as_bytes()));
                (iq, id)
            }
            RequestKind::SyncContacts { numbers } => {
                let self_jid = self.self_jid.clone();
                let (mut iq, id) = self
                    .factory
                    .iq("get", "urn:xmpp:whatsapp:sync", Some(self_jid.as_str()));
                let mut sync = Node::new("sync")
                    .with_attribute("mode", "full")
                    .with_attribute("context", "registration")
                    .with_attribute("index", "0")
                    .with_attribute("last", "true");
                for number in numbers {
                    sync.push_child(Node::new("user").with_data(number.as_bytes()));
                }
                iq.push_child(sync);
                (iq, id)
            }
            RequestKind::GetPrivacySettings => {
                let (mut iq, id) = self.factory.iq("get", "jabber:iq:privacy", None);
                iq.push_child(
                    Node::new("query")
                        .with_child(Node::new("list").with_attribute("name", "default")),
                );
                (iq, id)
            }
            RequestKind::SetPrivacySettings { name, value } => {
                let (mut iq, id) = self.factory.iq("set", "jabber:iq:privacy", None);
                iq.push_child(Node::new("query").with_child(
                    Node::new("list").with_attribute("name", "default").with_child(
                        Node::new("item")
                            .with_attribute("name", name.clone())
                            .with_attribute("value", value.clone()),
                    ),
                ));
                (iq, id)
            }
            RequestKind::GetProperties => {
                let (mut iq, id) = self.factory.iq("get", "w", None);
                iq.push_child(Node::new("props"));
                (iq, id)
            }
            RequestKind::GetPricing => {
                let (mut iq, id) = self.factory.iq("get", "urn:xmpp:whatsapp:account", None);
                iq.push_child(Node::new("pricing"));
                (iq, id)
            }
            RequestKind::ExtendAccount => {
                let (mut iq, id) = self.factory.iq("set", "urn:xmpp:whatsapp:account", None);
                iq.push_child(Node::new("extend"));
                (iq, id)
            }
        }
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}
