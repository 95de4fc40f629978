//! Session key derivation.
//!
//! The login challenge carries a server nonce; the four per-direction keys
//! are PBKDF2-SHA1 outputs over the account password with the nonce plus a
//! one-byte index as salt.

use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

/// Length of each derived key half.
pub const KEY_LEN: usize = 20;

/// PBKDF2 iteration count fixed by the protocol.
const ROUNDS: u32 = 2;

/// The account password was not valid base64.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyDerivationError;

impl std::fmt::Display for KeyDerivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "password is not valid base64")
    }
}

impl std::error::Error for KeyDerivationError {}

/// Derive the four 20-byte session keys from the base64 account password
/// and the server nonce.
///
/// Outputs, in order: writer cipher key, writer MAC key, reader cipher key,
/// reader MAC key. Salt for output `j` (1-based) is `nonce || j`.
pub fn derive_keys(
    password_b64: &str,
    nonce: &[u8],
) -> Result<[[u8; KEY_LEN]; 4], KeyDerivationError> {
    let password = base64::engine::general_purpose::STANDARD
        .decode(password_b64)
        .map_err(|_| KeyDerivationError)?;

    let mut keys = [[0u8; KEY_LEN]; 4];
    let mut salt = Vec::with_capacity(nonce.len() + 1);
    for (j, key) in keys.iter_mut().enumerate() {
        salt.clear();
        salt.extend_from_slice(nonce);
        salt.push(j as u8 + 1);
        pbkdf2_hmac::<Sha1>(&password, &salt, ROUNDS, key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_distinct_keys() {
        let keys = derive_keys("cGFzc3dvcmQ=", &[0xAA; 32]).unwrap();
        for i in 0..4 {
            for j in (i + 1)..4 {
                assert_ne!(keys[i], keys[j], "keys {i} and {j} collide");
            }
        }
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let a = derive_keys("cGFzc3dvcmQ=", &[0xAA; 32]).unwrap();
        let b = derive_keys("cGFzc3dvcmQ=", &[0xAA; 32]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nonce_changes_all_keys() {
        let a = derive_keys("cGFzc3dvcmQ=", &[0xAA; 32]).unwrap();
        let b = derive_keys("cGFzc3dvcmQ=", &[0xAB; 32]).unwrap();
        for j in 0..4 {
            assert_ne!(a[j], b[j]);
        }
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(derive_keys("not base64 !!!", &[0u8; 4]).is_err());
    }
}
