//! Node → frame encoder.

use waxmpp_crypto::{KeyStream, MAC_LEN};

use crate::dictionary::{Dictionary, Token};
use crate::reader::CodecError;
use crate::{
    Node, BINARY_20, BINARY_31, BINARY_8, DICT_FIRST, HEX_8, LIST_16, LIST_8, LIST_EMPTY,
    MAX_FRAME_LEN, MESSAGE_START, NIBBLE_8, STREAM_OPEN,
};

/// Encodes [`Node`] trees into wire frames.
///
/// Stateless apart from the dictionary and the optional keystream; one
/// writer is created per connection. Until [`Writer::set_keystream`] is
/// called frames go out in plaintext with a plain length header; afterwards
/// every frame is enciphered and carries the `0x80` marker bit.
pub struct Writer {
    dict: Dictionary,
    keystream: Option<KeyStream>,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            dict: Dictionary::default(),
            keystream: None,
        }
    }

    /// Install the negotiated outbound keystream. All subsequent frames are
    /// encrypted.
    pub fn set_keystream(&mut self, keystream: KeyStream) {
        self.keystream = Some(keystream);
    }

    /// `true` once a keystream is installed.
    pub fn is_encrypted(&self) -> bool {
        self.keystream.is_some()
    }

    /// The stream prologue plus stream-open header. Sent exactly once,
    /// immediately after the transport connects, always in plaintext.
    pub fn start_stream(&mut self, server: &str, resource: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        self.write_list_size(&mut body, 5); // tag + 2 attribute pairs
        body.push(STREAM_OPEN);
        self.write_string(&mut body, "to");
        self.write_string(&mut body, server);
        self.write_string(&mut body, "resource");
        self.write_string(&mut body, resource);

        let mut out = Vec::with_capacity(MESSAGE_START.len() + 3 + body.len());
        out.extend_from_slice(&MESSAGE_START);
        out.push(((body.len() >> 16) & 0x0f) as u8);
        out.push((body.len() >> 8) as u8);
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
        out
    }

    /// Encode one node into a complete frame (3-byte header + body).
    pub fn node(&mut self, node: &Node) -> Result<Vec<u8>, CodecError> {
        let mut tree = Vec::with_capacity(256);
        self.write_node(&mut tree, node);

        match &mut self.keystream {
            Some(ks) => {
                let len = tree.len() + MAC_LEN;
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLong { len });
                }
                let mut out = vec![0u8; 3 + len];
                out[0] = 0x80 | ((len >> 16) & 0x0f) as u8;
                out[1] = (len >> 8) as u8;
                out[2] = len as u8;
                out[3 + MAC_LEN..].copy_from_slice(&tree);
                ks.encode(&mut out[3..], 0, MAC_LEN, tree.len());
                Ok(out)
            }
            None => {
                let len = tree.len();
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLong { len });
                }
                let mut out = Vec::with_capacity(3 + len);
                out.push(((len >> 16) & 0x0f) as u8);
                out.push((len >> 8) as u8);
                out.push(len as u8);
                out.extend_from_slice(&tree);
                Ok(out)
            }
        }
    }

    // ── Tree encoding ──────────────────────────────────────────────────────

    fn write_node(&self, buf: &mut Vec<u8>, node: &Node) {
        let has_content = !node.children().is_empty() || node.data().is_some();
        let size = 1 + 2 * node.attributes().len() + usize::from(has_content);
        self.write_list_size(buf, size);
        self.write_string(buf, node.tag());
        for (k, v) in node.attributes() {
            self.write_string(buf, k);
            self.write_string(buf, v);
        }
        if !node.children().is_empty() {
            self.write_list_size(buf, node.children().len());
            for child in node.children() {
                self.write_node(buf, child);
            }
        } else if let Some(data) = node.data() {
            self.write_bytes(buf, data);
        }
    }

    fn write_list_size(&self, buf: &mut Vec<u8>, size: usize) {
        if size == 0 {
            buf.push(LIST_EMPTY);
        } else if size < 256 {
            buf.push(LIST_8);
            buf.push(size as u8);
        } else {
            buf.push(LIST_16);
            buf.push((size >> 8) as u8);
            buf.push(size as u8);
        }
    }

    /// Emit a string as a token if the dictionary carries it, otherwise in
    /// the most compact literal form (nibble pack, hex pack, raw bytes).
    fn write_string(&self, buf: &mut Vec<u8>, s: &str) {
        match self.dict.token_of(s) {
            Some(Token::Primary(t)) => buf.push(t),
            Some(Token::Secondary(table, index)) => {
                buf.push(DICT_FIRST + table);
                buf.push(index);
            }
            None => {
                if is_nibble_packable(s) {
                    self.write_packed(buf, s, NIBBLE_8, nibble_of);
                } else if is_hex_packable(s) {
                    self.write_packed(buf, s, HEX_8, hex_of);
                } else {
                    self.write_bytes(buf, s.as_bytes());
                }
            }
        }
    }

    fn write_packed(&self, buf: &mut Vec<u8>, s: &str, marker: u8, digit: fn(u8) -> u8) {
        let chars = s.as_bytes();
        let odd = chars.len() % 2 == 1;
        let packed = chars.len().div_ceil(2);
        buf.push(marker);
        let odd_bit = if odd { 0x80u8 } else { 0 };
        buf.push(odd_bit | packed as u8);
        for pair in chars.chunks(2) {
            let hi = digit(pair[0]);
            let lo = if pair.len() == 2 { digit(pair[1]) } else { 0x0f };
            buf.push(hi << 4 | lo);
        }
    }

    fn write_bytes(&self, buf: &mut Vec<u8>, data: &[u8]) {
        let len = data.len();
        if len < 256 {
            buf.push(BINARY_8);
            buf.push(len as u8);
        } else if len <= MAX_FRAME_LEN {
            buf.push(BINARY_20);
            buf.push(((len >> 16) & 0x0f) as u8);
            buf.push((len >> 8) as u8);
            buf.push(len as u8);
        } else {
            buf.push(BINARY_31);
            buf.extend_from_slice(&((len as u32) & 0x7fff_ffff).to_be_bytes());
        }
        buf.extend_from_slice(data);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Packed literal predicates ────────────────────────────────────────────────

/// Digits plus `-` and `.` (phone numbers, jid locals, timestamps).
fn is_nibble_packable(s: &str) -> bool {
    let len_ok = !s.is_empty() && s.len() <= 254;
    len_ok && s.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'.')
}

fn nibble_of(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'-' => 10,
        b'.' => 11,
        _ => unreachable!("checked by is_nibble_packable"),
    }
}

/// Uppercase hex (file hashes and similar).
fn is_hex_packable(s: &str) -> bool {
    let len_ok = !s.is_empty() && s.len() <= 254;
    len_ok && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn hex_of(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'F' => b - b'A' + 10,
        _ => unreachable!("checked by is_hex_packable"),
    }
}
