//! Per-direction frame cipher: RC4-drop-768 plus truncated HMAC-SHA1.
//!
//! Reader and writer each own their own `KeyStream`; the sequence counters
//! advance in lockstep with the remote end and are never shared between
//! directions. Losing counter sync is unrecoverable: the next MAC check
//! fails and the stream must be torn down.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::rc4::Rc4;
use crate::RC4_DROP;

type HmacSha1 = Hmac<Sha1>;

/// Length of the truncated MAC spliced into each frame.
pub const MAC_LEN: usize = 4;

/// MAC verification failure. Fatal to the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MacError {
    /// Sequence number the frame was checked against.
    pub seq: u32,
}

impl std::fmt::Display for MacError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame MAC mismatch at seq {}", self.seq)
    }
}

impl std::error::Error for MacError {}

/// One direction of the encrypted framing.
///
/// `encode` enciphers a region in place and splices a 4-byte MAC over the
/// ciphertext; `decode` verifies the MAC and deciphers. Both advance the
/// sequence counter, which is mixed into every MAC as a big-endian u32.
pub struct KeyStream {
    cipher: Rc4,
    mac_key: [u8; 20],
    seq: u32,
}

impl KeyStream {
    /// Build from the two 20-byte halves produced by [`crate::derive_keys`].
    pub fn new(cipher_key: [u8; 20], mac_key: [u8; 20]) -> Self {
        Self {
            cipher: Rc4::with_drop(&cipher_key, RC4_DROP),
            mac_key,
            seq: 0,
        }
    }

    fn compute_mac(&self, data: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha1::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.update(&self.seq.to_be_bytes());
        let full = mac.finalize().into_bytes();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&full[..MAC_LEN]);
        out
    }

    /// Encipher `buffer[offset..offset + length]` in place, then write the
    /// truncated MAC of the ciphertext at `buffer[mac_offset..]`.
    pub fn encode(&mut self, buffer: &mut [u8], mac_offset: usize, offset: usize, length: usize) {
        self.cipher.process(&mut buffer[offset..offset + length]);
        let mac = self.compute_mac(&buffer[offset..offset + length]);
        buffer[mac_offset..mac_offset + MAC_LEN].copy_from_slice(&mac);
        self.seq = self.seq.wrapping_add(1);
    }

    /// Verify the MAC at `buffer[mac_offset..]` against the ciphertext in
    /// `buffer[offset..offset + length]`, then decipher that region.
    ///
    /// The counter advances even on failure so a tampered frame cannot be
    /// replayed against the same sequence number.
    pub fn decode(
        &mut self,
        buffer: &mut [u8],
        mac_offset: usize,
        offset: usize,
        length: usize,
    ) -> Result<(), MacError> {
        let expected = self.compute_mac(&buffer[offset..offset + length]);
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        if buffer[mac_offset..mac_offset + MAC_LEN] != expected {
            return Err(MacError { seq });
        }
        self.cipher.process(&mut buffer[offset..offset + length]);
        Ok(())
    }

    /// Current sequence number (next frame's MAC input).
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (KeyStream, KeyStream) {
        let cipher_key = [0x11u8; 20];
        let mac_key = [0x22u8; 20];
        (
            KeyStream::new(cipher_key, mac_key),
            KeyStream::new(cipher_key, mac_key),
        )
    }

    #[test]
    fn encode_decode_lockstep() {
        let (mut tx, mut rx) = pair();
        for n in 0u8..5 {
            let body = vec![n; 16];
            let mut frame = vec![0u8; MAC_LEN + body.len()];
            frame[MAC_LEN..].copy_from_slice(&body);
            tx.encode(&mut frame, 0, MAC_LEN, body.len());
            assert_ne!(&frame[MAC_LEN..], &body[..]);
            rx.decode(&mut frame, 0, MAC_LEN, body.len()).unwrap();
            assert_eq!(&frame[MAC_LEN..], &body[..]);
        }
        assert_eq!(tx.seq(), rx.seq());
        assert_eq!(tx.seq(), 5);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = vec![0u8; MAC_LEN + 8];
        frame[MAC_LEN..].copy_from_slice(b"payload!");
        tx.encode(&mut frame, 0, MAC_LEN, 8);
        frame[0] ^= 0x01;
        assert!(rx.decode(&mut frame, 0, MAC_LEN, 8).is_err());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = vec![0u8; MAC_LEN + 8];
        frame[MAC_LEN..].copy_from_slice(b"payload!");
        tx.encode(&mut frame, 0, MAC_LEN, 8);
        frame[MAC_LEN + 3] ^= 0x80;
        assert!(rx.decode(&mut frame, 0, MAC_LEN, 8).is_err());
    }

    // Sequence reuse across frames must produce different MACs even for
    // identical plaintext.
    #[test]
    fn macs_differ_across_sequence() {
        let (mut tx, _) = pair();
        let mut a = vec![0u8; MAC_LEN + 4];
        let mut b = vec![0u8; MAC_LEN + 4];
        tx.encode(&mut a, 0, MAC_LEN, 4);
        tx.encode(&mut b, 0, MAC_LEN, 4);
        assert_ne!(&a[..MAC_LEN], &b[..MAC_LEN]);
    }
}
