//! Cryptographic primitives for the FunXMPP wire protocol.
//!
//! Provides:
//! - RC4 with configurable keystream discard (drop-768 on the wire)
//! - [`KeyStream`] — per-direction RC4 cipher + truncated HMAC-SHA1 MAC
//!   with a monotonic sequence counter
//! - [`derive_keys`] — PBKDF2-SHA1 derivation of the four 20-byte session
//!   keys from the account password and the server nonce

#![deny(unsafe_code)]

mod kdf;
mod keystream;
mod rc4;

pub use kdf::{derive_keys, KeyDerivationError, KEY_LEN};
pub use keystream::{KeyStream, MacError, MAC_LEN};
pub use rc4::Rc4;

/// Number of RC4 keystream bytes discarded before first use.
pub const RC4_DROP: usize = 768;
