//! Login handshake pieces: the features/auth/response stanzas, the
//! authenticated blob, and the challenge file.
//!
//! A persisted server nonce lets the next startup skip one round trip: the
//! `auth` node then carries the blob up front instead of waiting for a
//! fresh `challenge`.

use std::io;
use std::path::Path;

use chrono::Utc;
use waxmpp_codec::Node;
use waxmpp_crypto::KeyStream;

use crate::Config;

/// SASL-style mechanism name carried on the `auth` node.
pub(crate) const AUTH_MECHANISM: &str = "WAUTH-2";

// ─── Challenge file ──────────────────────────────────────────────────────────

/// The nonce persisted by the previous session, if any.
pub(crate) fn load_challenge(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) if !data.is_empty() => Some(data),
        _ => None,
    }
}

/// Overwrite the challenge file atomically (temp file + rename) so a crash
/// mid-write cannot leave a truncated nonce behind.
pub(crate) fn persist_challenge(path: &Path, nonce: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, nonce)?;
    std::fs::rename(&tmp, path)
}

// ─── Stanzas ─────────────────────────────────────────────────────────────────

pub(crate) fn features_node() -> Node {
    Node::new("stream:features")
        .with_child(Node::new("readreceipts"))
        .with_child(Node::new("groups_v2"))
        .with_child(Node::new("privacy"))
        .with_child(Node::new("presence"))
}

pub(crate) fn auth_node(msisdn: &str, blob: Option<Vec<u8>>) -> Node {
    let node = Node::new("auth")
        .with_attribute("mechanism", AUTH_MECHANISM)
        .with_attribute("user", msisdn);
    match blob {
        Some(blob) => node.with_data(blob),
        None => node,
    }
}

pub(crate) fn response_node(blob: Vec<u8>) -> Node {
    Node::new("response").with_data(blob)
}

/// The encrypted identity blob.
///
/// Layout before encryption: four reserved bytes (overwritten by the MAC),
/// the msisdn, the server nonce, the unix timestamp, the user agent, and
/// the ` MccMnc/…` trailer. The writer keystream enciphers everything past
/// the reserved bytes; its RC4 stream then continues into the frames that
/// follow, which is what ties the login to the negotiated keys.
pub(crate) fn auth_blob(config: &Config, nonce: &[u8], writer_key: &mut KeyStream) -> Vec<u8> {
    let ts = Utc::now().timestamp().to_string();
    let mut blob = Vec::with_capacity(64 + nonce.len());
    blob.extend_from_slice(&[0, 0, 0, 0]);
    blob.extend_from_slice(config.msisdn.as_bytes());
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(ts.as_bytes());
    blob.extend_from_slice(config.user_agent.as_bytes());
    blob.extend_from_slice(b" MccMnc/");
    blob.extend_from_slice(config.mcc.as_bytes());
    blob.extend_from_slice(config.mnc.as_bytes());

    let len = blob.len() - 4;
    writer_key.encode(&mut blob, 0, 4, len);
    blob
}

/// Human-readable reason from a `failure` node.
pub(crate) fn failure_reason(node: &Node) -> String {
    node.children()
        .first()
        .map(|c| c.tag().to_string())
        .unwrap_or_else(|| "not-authorized".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use waxmpp_crypto::derive_keys;

    fn test_config() -> Config {
        Config {
            msisdn: "491234567890".into(),
            password: "cGFzc3dvcmQ=".into(),
            ..Config::default()
        }
    }

    #[test]
    fn auth_blob_is_mac_fronted_and_decodable() {
        let config = test_config();
        let nonce = [0xAA; 32];
        let keys = derive_keys(&config.password, &nonce).unwrap();

        let mut writer_key = KeyStream::new(keys[0], keys[1]);
        let blob = auth_blob(&config, &nonce, &mut writer_key);
        assert_eq!(writer_key.seq(), 1);

        // The server mirrors our writer keys on its reader side.
        let mut server_side = KeyStream::new(keys[0], keys[1]);
        let mut copy = blob.clone();
        let len = copy.len() - 4;
        server_side.decode(&mut copy, 0, 4, len).unwrap();

        let plain = &copy[4..];
        assert!(plain.starts_with(b"491234567890"));
        assert_eq!(&plain[12..44], &nonce);
        assert!(plain.ends_with(b" MccMnc/001001"));
    }

    #[test]
    fn challenge_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("challenge");
        assert!(load_challenge(&path).is_none());

        persist_challenge(&path, &[0xAA; 32]).unwrap();
        assert_eq!(load_challenge(&path), Some(vec![0xAA; 32]));

        persist_challenge(&path, &[0xBB; 20]).unwrap();
        assert_eq!(load_challenge(&path), Some(vec![0xBB; 20]));
    }

    #[test]
    fn empty_challenge_file_counts_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("challenge");
        std::fs::write(&path, b"").unwrap();
        assert!(load_challenge(&path).is_none());
    }

    #[test]
    fn auth_node_shape() {
        let node = auth_node("491234567890", Some(vec![1, 2, 3]));
        assert_eq!(node.attribute("mechanism"), Some("WAUTH-2"));
        assert_eq!(node.attribute("user"), Some("491234567890"));
        assert_eq!(node.data(), Some(&[1u8, 2, 3][..]));

        let bare = auth_node("491234567890", None);
        assert_eq!(bare.data(), None);
    }
}
