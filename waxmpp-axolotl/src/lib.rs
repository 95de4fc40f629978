//! Axolotl (Signal-style) end-to-end encryption.
//!
//! Provides:
//! - key material: identity key pairs, one-time pre-keys, signed pre-keys,
//!   registration ids, pre-key bundles
//! - X3DH session establishment from a remote bundle (sender side) or from
//!   a received pre-key message (receiver side)
//! - per-message symmetric chains with skipped-key caching, AES-256-GCM
//!   payload encryption
//! - the fixed binary wire forms of `msg` and `pkmsg` ciphertexts
//!
//! Session state is a plain serializable [`SessionRecord`] so the host can
//! persist it as an opaque blob between messages.

#![deny(unsafe_code)]

mod keys;
mod message;
mod session;

pub use keys::{
    generate_registration_id, identity_dh_public, verify_signature, IdentityKeyPair, KeyPair,
    PreKeyBundle, PreKeyRecord, SignedPreKeyRecord, KEY_TYPE_DJB,
};
pub use message::{CipherMessage, PreKeyMessage, WhisperMessage, CIPHERTEXT_VERSION};
pub use session::{decrypt, encrypt, initiate, respond, ChainState, SessionRecord};

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from session establishment, encryption, or decryption.
#[derive(Clone, Debug, PartialEq)]
pub enum AxolotlError {
    /// The signed pre-key signature did not verify against the identity key.
    BadSignature,
    /// A public key was malformed (wrong length or type byte).
    BadKey,
    /// A ciphertext did not parse.
    InvalidMessage(&'static str),
    /// The message counter was already consumed.
    DuplicateMessage { counter: u32 },
    /// The message counter is implausibly far ahead of the chain.
    TooFarAhead { counter: u32 },
    /// AEAD open failed — wrong key or tampered ciphertext.
    DecryptFailed,
    /// The record's stored identity does not match the message.
    UntrustedIdentity,
}

impl fmt::Display for AxolotlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSignature => write!(f, "signed pre-key signature mismatch"),
            Self::BadKey => write!(f, "malformed public key"),
            Self::InvalidMessage(what) => write!(f, "invalid ciphertext: {what}"),
            Self::DuplicateMessage { counter } => {
                write!(f, "message counter {counter} already consumed")
            }
            Self::TooFarAhead { counter } => {
                write!(f, "message counter {counter} too far ahead")
            }
            Self::DecryptFailed => write!(f, "payload decryption failed"),
            Self::UntrustedIdentity => write!(f, "sender identity changed"),
        }
    }
}

impl std::error::Error for AxolotlError {}
