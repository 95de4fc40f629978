//! Session establishment and the per-message key chains.
//!
//! The X3DH agreement produces a 96-byte master block: a root key plus one
//! chain per direction. Each message key is struck from its chain with
//! HMAC-SHA256 and expanded to an AES-256-GCM key + nonce with HKDF. The
//! whole session is a serializable value so it can live in a key store
//! between messages.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::{identity_dh_public, verify_signature, IdentityKeyPair, KeyPair, PreKeyBundle};
use crate::message::{CipherMessage, PreKeyMessage, WhisperMessage};
use crate::{AxolotlError, KEY_TYPE_DJB};

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];
const KDF_INFO_MASTER: &[u8] = b"WhisperText";
const KDF_INFO_MESSAGE: &[u8] = b"WhisperMessageKeys";

/// How many message keys a chain will strike and cache when a counter
/// arrives ahead of the chain position.
const MAX_SKIP: u32 = 2000;

// ─── Chain state ─────────────────────────────────────────────────────────────

/// One direction's symmetric chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainState {
    pub key: [u8; 32],
    pub index: u32,
    /// Message keys struck for counters that arrived out of order.
    pub skipped: Vec<(u32, [u8; 32])>,
}

impl ChainState {
    fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            index: 0,
            skipped: Vec::new(),
        }
    }

    /// Strike the message key at the current index and advance.
    fn step(&mut self) -> [u8; 32] {
        let message_key = hmac_sha256(&self.key, MESSAGE_KEY_SEED);
        self.key = hmac_sha256(&self.key, CHAIN_KEY_SEED);
        self.index += 1;
        message_key
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

// ─── Session record ──────────────────────────────────────────────────────────

/// Pre-key info replayed in every outbound `pkmsg` until the first inbound
/// `msg` confirms the remote side holds the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

/// The complete state of one pairwise session. Opaque to the host; persist
/// as a blob via [`SessionRecord::to_bytes`] / [`SessionRecord::from_bytes`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub remote_identity: [u8; 32],
    pub local_identity: [u8; 32],
    pub local_registration_id: u32,
    pub remote_registration_id: u32,
    pub root_key: [u8; 32],
    send_chain: ChainState,
    recv_chain: ChainState,
    pending_pre_key: Option<PendingPreKey>,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("session record serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AxolotlError> {
        serde_json::from_slice(bytes).map_err(|_| AxolotlError::InvalidMessage("session record"))
    }

    /// `true` while outbound messages must still be `pkmsg`.
    pub fn is_pending(&self) -> bool {
        self.pending_pre_key.is_some()
    }
}

// ─── X3DH ────────────────────────────────────────────────────────────────────

/// Expand the concatenated agreements into root + two direction chains.
fn derive_master(dhs: &[&[u8; 32]]) -> ([u8; 32], [u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(32 + dhs.len() * 32);
    ikm.extend_from_slice(&[0xff; 32]);
    for dh in dhs {
        ikm.extend_from_slice(*dh);
    }

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 96];
    hk.expand(KDF_INFO_MASTER, &mut okm)
        .expect("96 bytes is a valid HKDF length");

    let mut root = [0u8; 32];
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    a.copy_from_slice(&okm[32..64]);
    b.copy_from_slice(&okm[64..]);
    (root, a, b)
}

/// Build a session from a fetched bundle (we are the initiator).
pub fn initiate(
    local_identity: &IdentityKeyPair,
    local_registration_id: u32,
    bundle: &PreKeyBundle,
) -> Result<SessionRecord, AxolotlError> {
    let mut signed = Vec::with_capacity(33);
    signed.push(KEY_TYPE_DJB);
    signed.extend_from_slice(&bundle.signed_pre_key);
    if !verify_signature(&bundle.identity_key, &signed, &bundle.signed_pre_key_signature) {
        return Err(AxolotlError::BadSignature);
    }

    let base = KeyPair::generate();
    let their_identity_dh = identity_dh_public(&bundle.identity_key)?;

    let dh1 = local_identity.agree(&bundle.signed_pre_key);
    let dh2 = base.agree(&their_identity_dh);
    let dh3 = base.agree(&bundle.signed_pre_key);
    let dh4 = bundle.pre_key.map(|otk| base.agree(&otk));

    let mut dhs: Vec<&[u8; 32]> = vec![&dh1, &dh2, &dh3];
    if let Some(dh4) = &dh4 {
        dhs.push(dh4);
    }
    let (root, initiator_chain, responder_chain) = derive_master(&dhs);

    Ok(SessionRecord {
        remote_identity: bundle.identity_key,
        local_identity: local_identity.public_bytes(),
        local_registration_id,
        remote_registration_id: bundle.registration_id,
        root_key: root,
        send_chain: ChainState::new(initiator_chain),
        recv_chain: ChainState::new(responder_chain),
        pending_pre_key: Some(PendingPreKey {
            pre_key_id: bundle.pre_key_id,
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: base.public_bytes(),
        }),
    })
}

/// Build a session from an inbound pre-key message (we are the responder).
///
/// `signed_pre_key` and `one_time_pre_key` are our own records the message
/// names by id; the caller looks them up in the key store.
pub fn respond(
    local_identity: &IdentityKeyPair,
    local_registration_id: u32,
    signed_pre_key: &KeyPair,
    one_time_pre_key: Option<&KeyPair>,
    message: &PreKeyMessage,
) -> Result<SessionRecord, AxolotlError> {
    let their_identity_dh = identity_dh_public(&message.identity_key)?;

    let dh1 = signed_pre_key.agree(&their_identity_dh);
    let dh2 = local_identity.agree(&message.base_key);
    let dh3 = signed_pre_key.agree(&message.base_key);
    let dh4 = one_time_pre_key.map(|otk| otk.agree(&message.base_key));

    let mut dhs: Vec<&[u8; 32]> = vec![&dh1, &dh2, &dh3];
    if let Some(dh4) = &dh4 {
        dhs.push(dh4);
    }
    let (root, initiator_chain, responder_chain) = derive_master(&dhs);

    Ok(SessionRecord {
        remote_identity: message.identity_key,
        local_identity: local_identity.public_bytes(),
        local_registration_id,
        remote_registration_id: message.registration_id,
        root_key: root,
        send_chain: ChainState::new(responder_chain),
        recv_chain: ChainState::new(initiator_chain),
        pending_pre_key: None,
    })
}

// ─── Encrypt / decrypt ───────────────────────────────────────────────────────

fn seal(message_key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let (key, nonce) = expand_message_key(message_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("AES-GCM encryption is infallible for in-memory buffers")
}

fn open(message_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, AxolotlError> {
    let (key, nonce) = expand_message_key(message_key);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| AxolotlError::DecryptFailed)
}

fn expand_message_key(message_key: &[u8; 32]) -> ([u8; 32], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 44];
    hk.expand(KDF_INFO_MESSAGE, &mut okm)
        .expect("44 bytes is a valid HKDF length");
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    (key, nonce)
}

/// Encrypt `plaintext` under the session, advancing the send chain.
pub fn encrypt(record: &mut SessionRecord, plaintext: &[u8]) -> CipherMessage {
    let counter = record.send_chain.index;
    let message_key = record.send_chain.step();
    let message = WhisperMessage {
        counter,
        previous_counter: 0,
        ciphertext: seal(&message_key, plaintext),
    };

    match &record.pending_pre_key {
        Some(pending) => CipherMessage::PreKey(PreKeyMessage {
            registration_id: record.local_registration_id,
            pre_key_id: pending.pre_key_id,
            signed_pre_key_id: pending.signed_pre_key_id,
            base_key: pending.base_key,
            identity_key: record.local_identity,
            message,
        }),
        None => CipherMessage::Whisper(message),
    }
}

/// Decrypt an inbound whisper message, advancing the receive chain.
///
/// Counters ahead of the chain strike and cache the skipped keys; counters
/// behind it are served from the cache once and then refused.
pub fn decrypt(
    record: &mut SessionRecord,
    message: &WhisperMessage,
) -> Result<Vec<u8>, AxolotlError> {
    let chain = &mut record.recv_chain;

    let message_key = if message.counter < chain.index {
        let pos = chain
            .skipped
            .iter()
            .position(|(c, _)| *c == message.counter)
            .ok_or(AxolotlError::DuplicateMessage {
                counter: message.counter,
            })?;
        chain.skipped.remove(pos).1
    } else {
        if message.counter - chain.index > MAX_SKIP {
            return Err(AxolotlError::TooFarAhead {
                counter: message.counter,
            });
        }
        while chain.index < message.counter {
            let skipped_index = chain.index;
            let key = chain.step();
            chain.skipped.push((skipped_index, key));
        }
        if chain.skipped.len() > MAX_SKIP as usize {
            log::warn!("dropping oldest skipped message keys");
            let excess = chain.skipped.len() - MAX_SKIP as usize;
            chain.skipped.drain(..excess);
        }
        chain.step()
    };

    let plaintext = open(&message_key, &message.ciphertext)?;
    // First successful inbound message confirms the session.
    record.pending_pre_key = None;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_registration_id, PreKeyRecord, SignedPreKeyRecord};

    struct Party {
        identity: IdentityKeyPair,
        registration_id: u32,
        pre_key: PreKeyRecord,
        signed_pre_key: SignedPreKeyRecord,
    }

    impl Party {
        fn new() -> Self {
            let identity = IdentityKeyPair::generate();
            let signed_pre_key = SignedPreKeyRecord::generate(1, &identity);
            Self {
                registration_id: generate_registration_id(),
                pre_key: PreKeyRecord::generate(100),
                signed_pre_key,
                identity,
            }
        }

        fn bundle(&self) -> PreKeyBundle {
            PreKeyBundle {
                registration_id: self.registration_id,
                identity_key: self.identity.public_bytes(),
                pre_key_id: Some(self.pre_key.id),
                pre_key: Some(self.pre_key.public),
                signed_pre_key_id: self.signed_pre_key.id,
                signed_pre_key: self.signed_pre_key.public,
                signed_pre_key_signature: self.signed_pre_key.signature.clone(),
            }
        }
    }

    fn establish() -> (SessionRecord, SessionRecord) {
        let alice = Party::new();
        let bob = Party::new();

        let mut alice_session = initiate(&alice.identity, alice.registration_id, &bob.bundle()).unwrap();
        let CipherMessage::PreKey(pkmsg) = encrypt(&mut alice_session, b"hello bob") else {
            panic!("first message must be a pkmsg");
        };

        let mut bob_session = respond(
            &bob.identity,
            bob.registration_id,
            &bob.signed_pre_key.key_pair(),
            Some(&bob.pre_key.key_pair()),
            &pkmsg,
        )
        .unwrap();
        let plain = decrypt(&mut bob_session, &pkmsg.message).unwrap();
        assert_eq!(plain, b"hello bob");

        (alice_session, bob_session)
    }

    #[test]
    fn establish_and_exchange_both_directions() {
        let (mut alice, mut bob) = establish();

        let CipherMessage::Whisper(reply) = encrypt(&mut bob, b"hi alice") else {
            panic!("responder never sends pkmsg");
        };
        assert_eq!(decrypt(&mut alice, &reply).unwrap(), b"hi alice");

        // Alice's session is confirmed after the first inbound message.
        assert!(!alice.is_pending());
        let CipherMessage::Whisper(second) = encrypt(&mut alice, b"how are you") else {
            panic!("confirmed session must send msg");
        };
        assert_eq!(decrypt(&mut bob, &second).unwrap(), b"how are you");
    }

    #[test]
    fn out_of_order_delivery_uses_skipped_keys() {
        let (mut alice, mut bob) = establish();

        let m1 = match encrypt(&mut alice, b"one") {
            CipherMessage::PreKey(m) => m.message,
            CipherMessage::Whisper(m) => m,
        };
        let m2 = match encrypt(&mut alice, b"two") {
            CipherMessage::PreKey(m) => m.message,
            CipherMessage::Whisper(m) => m,
        };

        assert_eq!(decrypt(&mut bob, &m2).unwrap(), b"two");
        assert_eq!(decrypt(&mut bob, &m1).unwrap(), b"one");
    }

    #[test]
    fn replay_is_refused() {
        let (mut alice, mut bob) = establish();
        let m = match encrypt(&mut alice, b"once") {
            CipherMessage::PreKey(m) => m.message,
            CipherMessage::Whisper(m) => m,
        };
        assert_eq!(decrypt(&mut bob, &m).unwrap(), b"once");
        assert!(matches!(
            decrypt(&mut bob, &m),
            Err(AxolotlError::DuplicateMessage { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut alice, mut bob) = establish();
        let mut m = match encrypt(&mut alice, b"secret") {
            CipherMessage::PreKey(m) => m.message,
            CipherMessage::Whisper(m) => m,
        };
        m.ciphertext[0] ^= 0x01;
        assert_eq!(decrypt(&mut bob, &m), Err(AxolotlError::DecryptFailed));
    }

    #[test]
    fn bad_bundle_signature_is_refused() {
        let alice = Party::new();
        let bob = Party::new();
        let mut bundle = bob.bundle();
        bundle.signed_pre_key_signature[0] ^= 0x01;
        assert!(matches!(
            initiate(&alice.identity, alice.registration_id, &bundle),
            Err(AxolotlError::BadSignature)
        ));
    }

    #[test]
    fn session_without_one_time_pre_key() {
        let alice = Party::new();
        let bob = Party::new();
        let mut bundle = bob.bundle();
        bundle.pre_key_id = None;
        bundle.pre_key = None;

        let mut alice_session = initiate(&alice.identity, alice.registration_id, &bundle).unwrap();
        let CipherMessage::PreKey(pkmsg) = encrypt(&mut alice_session, b"no otk") else {
            panic!("first message must be a pkmsg");
        };
        assert_eq!(pkmsg.pre_key_id, None);

        let mut bob_session = respond(
            &bob.identity,
            bob.registration_id,
            &bob.signed_pre_key.key_pair(),
            None,
            &pkmsg,
        )
        .unwrap();
        assert_eq!(decrypt(&mut bob_session, &pkmsg.message).unwrap(), b"no otk");
    }

    #[test]
    fn record_survives_persistence_roundtrip() {
        let (mut alice, bob) = establish();
        let blob = bob.to_bytes();
        let mut restored = SessionRecord::from_bytes(&blob).unwrap();

        let m = match encrypt(&mut alice, b"after reload") {
            CipherMessage::PreKey(m) => m.message,
            CipherMessage::Whisper(m) => m,
        };
        assert_eq!(decrypt(&mut restored, &m).unwrap(), b"after reload");
    }
}
