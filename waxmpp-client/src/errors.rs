//! Error types for waxmpp-client.

use std::{fmt, io};

use waxmpp_codec::CodecError;

// ─── RequestError ─────────────────────────────────────────────────────────────

/// An error the server attached to an `iq` reply.
///
/// Carried inside an `<error code="…">` child; `text` is the tag of the
/// condition element (`item-not-found`, `not-authorized`, …) when present.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestError {
    pub code: u16,
    pub text: String,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed {}: {}", self.code, self.text)
    }
}

impl std::error::Error for RequestError {}

impl RequestError {
    /// Match on the condition text, with optional wildcard prefix/suffix `'*'`.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.text.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.text.ends_with(suffix)
        } else {
            self.text == pattern
        }
    }
}

// ─── ClientError ──────────────────────────────────────────────────────────────

/// The error type returned from any [`crate::Client`] method.
#[derive(Debug)]
pub enum ClientError {
    /// Malformed frame, unknown token, MAC mismatch — fatal to the stream.
    Protocol(CodecError),
    /// The server rejected the login handshake.
    Auth(String),
    /// The server answered a request with an error stanza. Not fatal.
    Request(RequestError),
    /// Thumbnail, upload, or download failure. Not fatal to the session.
    Media(String),
    /// Socket-level failure; triggers the reconnect policy.
    Transport(io::Error),
    /// Decryption failure, missing session, or pre-key mismatch. The
    /// affected message is dropped; the session continues.
    Encryption(waxmpp_axolotl::AxolotlError),
    /// Key derivation failed (bad password encoding).
    KeyDerivation,
    /// A tracked request was issued before the handshake completed.
    NotLoggedIn,
    /// The session is gone; any pending request resolves with this.
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Auth(reason) => write!(f, "authentication failed: {reason}"),
            Self::Request(e) => write!(f, "{e}"),
            Self::Media(reason) => write!(f, "media error: {reason}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encryption(e) => write!(f, "encryption error: {e}"),
            Self::KeyDerivation => write!(f, "could not derive session keys"),
            Self::NotLoggedIn => write!(f, "not logged in"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        Self::Protocol(e)
    }
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        Self::Request(e)
    }
}

impl From<waxmpp_axolotl::AxolotlError> for ClientError {
    fn from(e: waxmpp_axolotl::AxolotlError) -> Self {
        Self::Encryption(e)
    }
}

impl ClientError {
    /// `true` for errors that require tearing the stream down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Auth(_) | Self::Transport(_) | Self::Disconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_error_wildcards() {
        let e = RequestError {
            code: 404,
            text: "item-not-found".into(),
        };
        assert!(e.is("item-not-found"));
        assert!(e.is("item-*"));
        assert!(e.is("*-found"));
        assert!(!e.is("not-authorized"));
    }

    #[test]
    fn fatality_classification() {
        assert!(ClientError::Auth("denied".into()).is_fatal());
        assert!(!ClientError::Request(RequestError {
            code: 404,
            text: "item-not-found".into()
        })
        .is_fatal());
        assert!(!ClientError::Media("thumbnail".into()).is_fatal());
    }
}
