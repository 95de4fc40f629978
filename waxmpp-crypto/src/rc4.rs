//! RC4 stream cipher with keystream discard.
//!
//! Kept local: the registry RC4 crates do not expose the drop-N variant
//! this protocol negotiates, and the whole cipher is a page of code.

/// RC4 cipher state.
///
/// Construct with [`Rc4::with_drop`] to discard the first `drop` keystream
/// bytes (the wire protocol uses drop-768), then call [`Rc4::process`] on
/// each buffer in order. Encryption and decryption are the same operation.
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Key-schedule `key` without discarding any keystream.
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (n, v) in s.iter_mut().enumerate() {
            *v = n as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    /// Key-schedule `key` and discard the first `drop` keystream bytes.
    pub fn with_drop(key: &[u8], drop: usize) -> Self {
        let mut rc4 = Self::new(key);
        for _ in 0..drop {
            rc4.next_byte();
        }
        rc4
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
        self.s[idx as usize]
    }

    /// XOR `data` with the keystream in place.
    pub fn process(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6229 test vector: key 0x0102030405, offset 0.
    #[test]
    fn rfc6229_key_5_bytes() {
        let mut rc4 = Rc4::new(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut buf = [0u8; 16];
        rc4.process(&mut buf);
        assert_eq!(
            buf,
            [
                0xb2, 0x39, 0x63, 0x05, 0xf0, 0x3d, 0xc0, 0x27,
                0xcc, 0xc3, 0x52, 0x4a, 0x0a, 0x11, 0x18, 0xa8,
            ]
        );
    }

    // Dropping N bytes must land on the same keystream position as
    // enciphering N bytes of anything.
    #[test]
    fn with_drop_skips_keystream() {
        let key = [0x01, 0x02, 0x03, 0x04, 0x05];
        let mut dropped = Rc4::with_drop(&key, 768);
        let mut manual = Rc4::new(&key);
        manual.process(&mut [0u8; 768]);

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        dropped.process(&mut a);
        manual.process(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn process_roundtrip() {
        let key = b"a shared secret";
        let mut enc = Rc4::with_drop(key, 768);
        let mut dec = Rc4::with_drop(key, 768);
        let mut data = b"hello, stream".to_vec();
        enc.process(&mut data);
        assert_ne!(&data, b"hello, stream");
        dec.process(&mut data);
        assert_eq!(&data, b"hello, stream");
    }
}
