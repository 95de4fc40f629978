//! Wire forms of the two ciphertext kinds.
//!
//! `msg` (whisper message) is sent once a session exists; `pkmsg` (pre-key
//! message) additionally carries the key material the receiver needs to
//! establish the session. Layout is a fixed big-endian framing behind a
//! version byte.

use crate::keys::KEY_TYPE_DJB;
use crate::AxolotlError;

/// Version byte on every ciphertext: protocol 3, minimum 3.
pub const CIPHERTEXT_VERSION: u8 = 0x33;

/// Marker for "no one-time pre-key" in a `pkmsg`.
const NO_PRE_KEY: u32 = u32::MAX;

// ─── WhisperMessage ──────────────────────────────────────────────────────────

/// An ordinary session ciphertext (`<enc type="msg">`).
#[derive(Clone, Debug, PartialEq)]
pub struct WhisperMessage {
    /// Send-chain counter of the message key.
    pub counter: u32,
    /// Counter of the previous send chain (kept for format stability).
    pub previous_counter: u32,
    /// AES-256-GCM ciphertext (tag appended).
    pub ciphertext: Vec<u8>,
}

impl WhisperMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13 + self.ciphertext.len());
        out.push(CIPHERTEXT_VERSION);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.previous_counter.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AxolotlError> {
        if bytes.len() < 13 {
            return Err(AxolotlError::InvalidMessage("msg too short"));
        }
        if bytes[0] != CIPHERTEXT_VERSION {
            return Err(AxolotlError::InvalidMessage("unsupported version"));
        }
        let counter = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let previous_counter = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        let len = u32::from_be_bytes(bytes[9..13].try_into().unwrap()) as usize;
        if bytes.len() != 13 + len {
            return Err(AxolotlError::InvalidMessage("msg length mismatch"));
        }
        Ok(Self {
            counter,
            previous_counter,
            ciphertext: bytes[13..].to_vec(),
        })
    }
}

// ─── PreKeyMessage ───────────────────────────────────────────────────────────

/// A session-establishing ciphertext (`<enc type="pkmsg">`).
#[derive(Clone, Debug, PartialEq)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    /// Sender's ephemeral base key.
    pub base_key: [u8; 32],
    /// Sender's public identity key (Ed25519 form).
    pub identity_key: [u8; 32],
    /// The wrapped [`WhisperMessage`].
    pub message: WhisperMessage,
}

impl PreKeyMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.message.to_bytes();
        let mut out = Vec::with_capacity(13 + 66 + inner.len());
        out.push(CIPHERTEXT_VERSION);
        out.extend_from_slice(&self.registration_id.to_be_bytes());
        out.extend_from_slice(&self.pre_key_id.unwrap_or(NO_PRE_KEY).to_be_bytes());
        out.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        out.push(KEY_TYPE_DJB);
        out.extend_from_slice(&self.base_key);
        out.push(KEY_TYPE_DJB);
        out.extend_from_slice(&self.identity_key);
        out.extend_from_slice(&inner);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AxolotlError> {
        if bytes.len() < 13 + 66 + 13 {
            return Err(AxolotlError::InvalidMessage("pkmsg too short"));
        }
        if bytes[0] != CIPHERTEXT_VERSION {
            return Err(AxolotlError::InvalidMessage("unsupported version"));
        }
        let registration_id = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let raw_pre_key_id = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        let signed_pre_key_id = u32::from_be_bytes(bytes[9..13].try_into().unwrap());

        if bytes[13] != KEY_TYPE_DJB || bytes[46] != KEY_TYPE_DJB {
            return Err(AxolotlError::BadKey);
        }
        let base_key: [u8; 32] = bytes[14..46].try_into().unwrap();
        let identity_key: [u8; 32] = bytes[47..79].try_into().unwrap();

        Ok(Self {
            registration_id,
            pre_key_id: (raw_pre_key_id != NO_PRE_KEY).then_some(raw_pre_key_id),
            signed_pre_key_id,
            base_key,
            identity_key,
            message: WhisperMessage::from_bytes(&bytes[79..])?,
        })
    }
}

// ─── CipherMessage ───────────────────────────────────────────────────────────

/// What [`crate::encrypt`] produced for a given session state.
#[derive(Clone, Debug, PartialEq)]
pub enum CipherMessage {
    /// Session already confirmed — send as `<enc type="msg">`.
    Whisper(WhisperMessage),
    /// Session still pending — send as `<enc type="pkmsg">`.
    PreKey(PreKeyMessage),
}

impl CipherMessage {
    /// The `type` attribute value for the `enc` node.
    pub fn enc_type(&self) -> &'static str {
        match self {
            Self::Whisper(_) => "msg",
            Self::PreKey(_) => "pkmsg",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Whisper(m) => m.to_bytes(),
            Self::PreKey(m) => m.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whisper_roundtrip() {
        let msg = WhisperMessage {
            counter: 7,
            previous_counter: 0,
            ciphertext: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(WhisperMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn pre_key_roundtrip_with_and_without_otk() {
        for pre_key_id in [Some(31u32), None] {
            let msg = PreKeyMessage {
                registration_id: 0x1234,
                pre_key_id,
                signed_pre_key_id: 1,
                base_key: [0xAB; 32],
                identity_key: [0xCD; 32],
                message: WhisperMessage {
                    counter: 0,
                    previous_counter: 0,
                    ciphertext: vec![9; 32],
                },
            };
            assert_eq!(PreKeyMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
        }
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        let msg = WhisperMessage {
            counter: 1,
            previous_counter: 0,
            ciphertext: vec![0; 16],
        };
        let bytes = msg.to_bytes();
        assert!(WhisperMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(WhisperMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = WhisperMessage {
            counter: 1,
            previous_counter: 0,
            ciphertext: vec![0; 16],
        }
        .to_bytes();
        bytes[0] = 0x22;
        assert!(matches!(
            WhisperMessage::from_bytes(&bytes),
            Err(AxolotlError::InvalidMessage("unsupported version"))
        ));
    }
}
