//! The bridge between the session and the Axolotl layer.
//!
//! Owns the per-JID session cache, the pending-plaintext queues, and the
//! pre-key fetch/publish protocol. Everything durable goes through the
//! [`KeyStore`]; everything outbound is returned as ready-to-send nodes so
//! the session keeps sole control of the wire.

use std::collections::{HashMap, HashSet};

use waxmpp_axolotl::{
    decrypt as axolotl_decrypt, encrypt as axolotl_encrypt, initiate, respond, CipherMessage,
    IdentityKeyPair, PreKeyBundle, PreKeyMessage, PreKeyRecord, SessionRecord,
    SignedPreKeyRecord, WhisperMessage,
};
use waxmpp_codec::Node;

use crate::errors::ClientError;
use crate::factory::NodeFactory;
use crate::keystore::{KeyStore, LocalIdentity};

/// The only device id this client uses.
pub(crate) const DEVICE_ID: u32 = 1;

/// How many one-time pre-keys we keep published.
const PRE_KEY_TARGET: usize = 200;

/// Fixed id of the current signed pre-key.
const SIGNED_PRE_KEY_ID: u32 = 1;

/// What became of an encrypted-send request.
pub(crate) enum EncryptOutcome {
    /// A complete message node, ready to go out.
    Send(Node),
    /// Keys are being fetched; this fetch `iq` must go out first.
    Fetch(Node),
    /// Queued behind a fetch that is already in flight.
    Queued,
}

pub(crate) struct EncryptionBridge {
    identity: Option<IdentityKeyPair>,
    registration_id: u32,
    sessions: HashMap<String, SessionRecord>,
    /// Plaintext queued per JID while keys are being fetched.
    pending_plain: HashMap<String, Vec<String>>,
    /// Fetch iq id → the JIDs it asked for.
    pending_fetches: HashMap<String, Vec<String>>,
    /// JIDs the server has no keys for; sends go out unencrypted.
    skip_encryption: HashSet<String>,
}

impl EncryptionBridge {
    pub fn new() -> Self {
        Self {
            identity: None,
            registration_id: 0,
            sessions: HashMap::new(),
            pending_plain: HashMap::new(),
            pending_fetches: HashMap::new(),
            skip_encryption: HashSet::new(),
        }
    }

    // ── Identity / publication ─────────────────────────────────────────────

    /// Load the local identity, generating and publishing a fresh one on
    /// the first login after registration. Returns the publish `iq`, if
    /// one must be sent.
    pub async fn ensure_initialized(
        &mut self,
        store: &dyn KeyStore,
        factory: &mut NodeFactory,
    ) -> Result<Option<Node>, ClientError> {
        if let Some(local) = store.local_identity().await? {
            self.identity = Some(IdentityKeyPair::from_seed(local.identity_seed));
            self.registration_id = local.registration_id;
            return Ok(None);
        }

        let identity = IdentityKeyPair::generate();
        let registration_id = waxmpp_axolotl::generate_registration_id();
        store
            .store_local_identity(LocalIdentity {
                registration_id,
                identity_seed: identity.seed(),
            })
            .await?;

        let signed = SignedPreKeyRecord::generate(SIGNED_PRE_KEY_ID, &identity);
        store
            .store_signed_pre_key(signed.id, serde_json::to_vec(&signed).map_err(json_err)?)
            .await?;

        let pre_keys = self.generate_pre_keys(store, PRE_KEY_TARGET).await?;

        tracing::info!(registration_id, "generated fresh identity, publishing pre-keys");
        self.identity = Some(identity);
        self.registration_id = registration_id;
        Ok(Some(self.publish_node(factory, &pre_keys, Some(&signed))))
    }

    async fn generate_pre_keys(
        &mut self,
        store: &dyn KeyStore,
        count: usize,
    ) -> Result<Vec<PreKeyRecord>, ClientError> {
        let mut ids = HashSet::new();
        let mut records = Vec::with_capacity(count);
        while records.len() < count {
            let id = random_pre_key_id();
            if !ids.insert(id) {
                continue;
            }
            let record = PreKeyRecord::generate(id);
            store
                .store_pre_key(id, serde_json::to_vec(&record).map_err(json_err)?)
                .await?;
            records.push(record);
        }
        Ok(records)
    }

    fn publish_node(
        &self,
        factory: &mut NodeFactory,
        pre_keys: &[PreKeyRecord],
        signed: Option<&SignedPreKeyRecord>,
    ) -> Node {
        let mut list = Node::new("list");
        for record in pre_keys {
            list.push_child(
                Node::new("key")
                    .with_child(Node::new("id").with_data(be24(record.id)))
                    .with_child(Node::new("value").with_data(record.public.to_vec())),
            );
        }

        let (mut iq, _) = factory.iq("set", "encrypt", None);
        iq.push_child(list);
        iq.push_child(
            Node::new("registration").with_data(self.registration_id.to_be_bytes().to_vec()),
        );
        iq.push_child(Node::new("type").with_data(vec![waxmpp_axolotl::KEY_TYPE_DJB]));
        if let Some(identity) = &self.identity {
            iq.push_child(Node::new("identity").with_data(identity.public_bytes().to_vec()));
        }
        if let Some(signed) = signed {
            iq.push_child(
                Node::new("skey")
                    .with_child(Node::new("id").with_data(be24(signed.id)))
                    .with_child(Node::new("value").with_data(signed.public.to_vec()))
                    .with_child(Node::new("signature").with_data(signed.signature.clone())),
            );
        }
        iq
    }

    /// Top up the published pre-keys after an `encrypt` notification said
    /// only `remaining` are left on the server.
    pub async fn replenish(
        &mut self,
        store: &dyn KeyStore,
        remaining: usize,
        factory: &mut NodeFactory,
    ) -> Result<Option<Node>, ClientError> {
        if remaining >= PRE_KEY_TARGET {
            return Ok(None);
        }
        let fresh = self
            .generate_pre_keys(store, PRE_KEY_TARGET - remaining)
            .await?;
        tracing::debug!(count = fresh.len(), "replenishing pre-keys");
        Ok(Some(self.publish_node(factory, &fresh, None)))
    }

    // ── Outbound ───────────────────────────────────────────────────────────

    /// Encrypt `body` for `to`, or queue it and fetch keys first.
    pub async fn send_encrypted(
        &mut self,
        store: &dyn KeyStore,
        to: &str,
        body: &str,
        factory: &mut NodeFactory,
    ) -> Result<EncryptOutcome, ClientError> {
        if self.skip_encryption.contains(to) {
            return Ok(EncryptOutcome::Send(
                factory.text_message(to, body.as_bytes()),
            ));
        }

        if !self.sessions.contains_key(to) {
            if let Some(blob) = store.load_session(to, DEVICE_ID).await? {
                let record = SessionRecord::from_bytes(&blob)?;
                self.sessions.insert(to.to_string(), record);
            }
        }

        if self.sessions.contains_key(to) {
            let node = self.encrypt_into_node(store, to, body, factory).await?;
            return Ok(EncryptOutcome::Send(node));
        }

        // No session anywhere: queue the plaintext and fetch keys.
        self.pending_plain
            .entry(to.to_string())
            .or_default()
            .push(body.to_string());

        let already_fetching = self
            .pending_fetches
            .values()
            .any(|jids| jids.iter().any(|j| j == to));
        if already_fetching {
            return Ok(EncryptOutcome::Queued);
        }

        let (mut iq, id) = factory.iq("get", "encrypt", None);
        let mut key = Node::new("key");
        key.push_child(Node::new("user").with_attribute("jid", to));
        iq.push_child(key);
        self.pending_fetches.insert(id, vec![to.to_string()]);
        Ok(EncryptOutcome::Fetch(iq))
    }

    async fn encrypt_into_node(
        &mut self,
        store: &dyn KeyStore,
        to: &str,
        body: &str,
        factory: &mut NodeFactory,
    ) -> Result<Node, ClientError> {
        let record = self
            .sessions
            .get_mut(to)
            .expect("caller checked the session exists");
        let cipher = axolotl_encrypt(record, body.as_bytes());
        store
            .store_session(to, DEVICE_ID, record.to_bytes())
            .await?;
        Ok(factory.enc_message(to, cipher.enc_type(), cipher.to_bytes()))
    }

    // ── Pre-key fetch replies ──────────────────────────────────────────────

    /// `true` if this iq id belongs to one of our pre-key fetches.
    pub fn is_fetch(&self, id: &str) -> bool {
        self.pending_fetches.contains_key(id)
    }

    /// Process a pre-key fetch reply: build sessions for every user the
    /// server knows, mark the rest as plaintext-only, and drain the queued
    /// messages for all affected JIDs into ready-to-send nodes.
    pub async fn handle_fetch_reply(
        &mut self,
        store: &dyn KeyStore,
        node: &Node,
        factory: &mut NodeFactory,
    ) -> Result<Vec<Node>, ClientError> {
        let id = node.attribute("id").unwrap_or_default().to_string();
        let requested = self.pending_fetches.remove(&id).unwrap_or_default();
        let identity = self.identity.clone().ok_or(ClientError::NotLoggedIn)?;

        let mut answered = HashSet::new();
        if let Some(list) = node.child("list") {
            for user in list.children().iter().filter(|c| c.tag() == "user") {
                let Some(jid) = user.attribute("jid").map(str::to_string) else {
                    continue;
                };
                match parse_bundle(user) {
                    Ok(bundle) => match initiate(&identity, self.registration_id, &bundle) {
                        Ok(record) => {
                            store.store_session(&jid, DEVICE_ID, record.to_bytes()).await?;
                            self.sessions.insert(jid.clone(), record);
                            answered.insert(jid);
                        }
                        Err(e) => {
                            tracing::warn!(jid = %jid, error = %e, "rejected pre-key bundle");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(jid = %jid, error = %e, "malformed pre-key bundle");
                    }
                }
            }
        }

        // Whoever we asked about and got nothing back for has no keys on
        // the server; their queued messages go out in the clear.
        for jid in &requested {
            if !answered.contains(jid) {
                tracing::debug!(jid = %jid, "no pre-keys on server, skipping encryption");
                self.skip_encryption.insert(jid.clone());
            }
        }

        let mut out = Vec::new();
        for jid in requested {
            for body in self.pending_plain.remove(&jid).unwrap_or_default() {
                if self.sessions.contains_key(&jid) {
                    out.push(self.encrypt_into_node(store, &jid, &body, factory).await?);
                } else {
                    out.push(factory.text_message(&jid, body.as_bytes()));
                }
            }
        }
        Ok(out)
    }

    // ── Inbound ────────────────────────────────────────────────────────────

    /// Decrypt the `enc` child of an inbound message, returning an
    /// equivalent plaintext message node. `None` if the node has no `enc`.
    pub async fn decrypt_message(
        &mut self,
        store: &dyn KeyStore,
        node: &Node,
    ) -> Result<Option<Node>, ClientError> {
        let Some(enc) = node.child("enc") else {
            return Ok(None);
        };
        let from = node.attribute("from").unwrap_or_default().to_string();
        let ciphertext = enc.data().unwrap_or_default();

        let plaintext = match enc.attribute("type") {
            Some("pkmsg") => {
                let message = PreKeyMessage::from_bytes(ciphertext)?;
                self.establish_inbound(store, &from, &message).await?;
                self.decrypt_with_session(store, &from, &message.message)
                    .await?
            }
            Some("msg") => {
                let message = WhisperMessage::from_bytes(ciphertext)?;
                self.decrypt_with_session(store, &from, &message).await?
            }
            other => {
                tracing::warn!(from = %from, enc_type = ?other, "unknown enc type, dropping");
                return Err(ClientError::Encryption(
                    waxmpp_axolotl::AxolotlError::InvalidMessage("unknown enc type"),
                ));
            }
        };

        // Re-emit as an ordinary text message so the processor and every
        // downstream consumer see one shape.
        let mut plain = Node::new("message");
        for (k, v) in node.attributes() {
            plain.set_attribute(k.clone(), v.clone());
        }
        plain.push_child(Node::new("body").with_data(plaintext));
        Ok(Some(plain))
    }

    async fn establish_inbound(
        &mut self,
        store: &dyn KeyStore,
        from: &str,
        message: &PreKeyMessage,
    ) -> Result<(), ClientError> {
        if self.sessions.contains_key(from) {
            // Retransmitted pkmsg for a session we already hold.
            return Ok(());
        }
        if let Some(blob) = store.load_session(from, DEVICE_ID).await? {
            self.sessions
                .insert(from.to_string(), SessionRecord::from_bytes(&blob)?);
            return Ok(());
        }

        let identity = self.identity.clone().ok_or(ClientError::NotLoggedIn)?;
        let signed_blob = store
            .signed_pre_key(message.signed_pre_key_id)
            .await?
            .ok_or(ClientError::Encryption(
                waxmpp_axolotl::AxolotlError::InvalidMessage("unknown signed pre-key id"),
            ))?;
        let signed: SignedPreKeyRecord = serde_json::from_slice(&signed_blob).map_err(json_err)?;

        let one_time = match message.pre_key_id {
            None => None,
            Some(id) => match store.pre_key(id).await? {
                None => {
                    return Err(ClientError::Encryption(
                        waxmpp_axolotl::AxolotlError::InvalidMessage("unknown pre-key id"),
                    ))
                }
                Some(blob) => {
                    let record: PreKeyRecord = serde_json::from_slice(&blob).map_err(json_err)?;
                    Some(record)
                }
            },
        };

        let record = respond(
            &identity,
            self.registration_id,
            &signed.key_pair(),
            one_time.as_ref().map(|r| r.key_pair()).as_ref(),
            message,
        )?;

        // The one-time pre-key is consumed by this session.
        if let Some(record) = &one_time {
            store.remove_pre_key(record.id).await?;
        }
        store.store_session(from, DEVICE_ID, record.to_bytes()).await?;
        self.sessions.insert(from.to_string(), record);
        Ok(())
    }

    async fn decrypt_with_session(
        &mut self,
        store: &dyn KeyStore,
        from: &str,
        message: &WhisperMessage,
    ) -> Result<Vec<u8>, ClientError> {
        if !self.sessions.contains_key(from) {
            match store.load_session(from, DEVICE_ID).await? {
                Some(blob) => {
                    self.sessions
                        .insert(from.to_string(), SessionRecord::from_bytes(&blob)?);
                }
                None => {
                    return Err(ClientError::Encryption(
                        waxmpp_axolotl::AxolotlError::InvalidMessage("no session for sender"),
                    ))
                }
            }
        }
        let record = self.sessions.get_mut(from).expect("just inserted");
        let plaintext = axolotl_decrypt(record, message)?;
        store
            .store_session(from, DEVICE_ID, record.to_bytes())
            .await?;
        Ok(plaintext)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn json_err(e: serde_json::Error) -> ClientError {
    ClientError::Transport(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn be24(v: u32) -> Vec<u8> {
    vec![(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

fn read_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| acc << 8 | *b as u32)
}

fn parse_bundle(user: &Node) -> Result<PreKeyBundle, ClientError> {
    let bad = |what: &'static str| {
        ClientError::Encryption(waxmpp_axolotl::AxolotlError::InvalidMessage(what))
    };

    let registration_id = read_be(
        user.child("registration")
            .and_then(Node::data)
            .ok_or(bad("missing registration"))?,
    );
    let identity_key: [u8; 32] = user
        .child("identity")
        .and_then(Node::data)
        .ok_or(bad("missing identity"))?
        .try_into()
        .map_err(|_| bad("bad identity length"))?;

    let skey = user.child("skey").ok_or(bad("missing skey"))?;
    let signed_pre_key_id = read_be(skey.child("id").and_then(Node::data).ok_or(bad("skey id"))?);
    let signed_pre_key: [u8; 32] = skey
        .child("value")
        .and_then(Node::data)
        .ok_or(bad("skey value"))?
        .try_into()
        .map_err(|_| bad("bad skey length"))?;
    let signed_pre_key_signature = skey
        .child("signature")
        .and_then(Node::data)
        .ok_or(bad("skey signature"))?
        .to_vec();

    let (pre_key_id, pre_key) = match user.child("key") {
        None => (None, None),
        Some(key) => {
            let id = read_be(key.child("id").and_then(Node::data).ok_or(bad("key id"))?);
            let value: [u8; 32] = key
                .child("value")
                .and_then(Node::data)
                .ok_or(bad("key value"))?
                .try_into()
                .map_err(|_| bad("bad key length"))?;
            (Some(id), Some(value))
        }
    };

    Ok(PreKeyBundle {
        registration_id,
        identity_key,
        pre_key_id,
        pre_key,
        signed_pre_key_id,
        signed_pre_key,
        signed_pre_key_signature,
    })
}

fn random_pre_key_id() -> u32 {
    let mut bytes = [0u8; 4];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    let id = u32::from_be_bytes(bytes) & 0x00ff_ffff;
    id.max(1)
}
