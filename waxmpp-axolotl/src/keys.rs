//! Key material: Curve25519 pre-keys and the Ed25519 identity.
//!
//! The identity key signs (Ed25519) and also takes part in the X3DH
//! agreement: its scalar doubles as an X25519 secret via
//! [`ed25519_dalek::SigningKey::to_scalar_bytes`], and the public edwards
//! point converts to montgomery form for the remote side's agreement.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{x25519, PublicKey, StaticSecret};

/// Type byte prefixed to every curve public key on the wire.
pub const KEY_TYPE_DJB: u8 = 0x05;

// ─── KeyPair ─────────────────────────────────────────────────────────────────

/// An X25519 key pair (pre-keys, signed pre-keys, session base keys).
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 agreement with a raw peer public key.
    pub fn agree(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        *self
            .secret
            .diffie_hellman(&PublicKey::from(*peer_public))
            .as_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({:02x?}…)", &self.public_bytes()[..4])
    }
}

// ─── IdentityKeyPair ─────────────────────────────────────────────────────────

/// The long-lived identity: an Ed25519 signing key that also performs
/// X25519 agreement through scalar/point conversion.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// The 32-byte seed for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public identity key (Ed25519 form), as published in bundles.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// X25519 agreement between the identity scalar and a raw curve public.
    pub fn agree(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        x25519(self.signing.to_scalar_bytes(), *peer_public)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeyPair({:02x?}…)", &self.public_bytes()[..4])
    }
}

/// Montgomery form of a public identity key, for agreement against it.
pub fn identity_dh_public(identity_public: &[u8; 32]) -> Result<[u8; 32], crate::AxolotlError> {
    let vk = VerifyingKey::from_bytes(identity_public).map_err(|_| crate::AxolotlError::BadKey)?;
    Ok(vk.to_montgomery().to_bytes())
}

/// Verify an identity-key signature.
pub fn verify_signature(identity_public: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(identity_public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(message, &sig).is_ok()
}

/// Random 14-bit registration id, never zero.
pub fn generate_registration_id() -> u32 {
    loop {
        let id = OsRng.next_u32() & 0x3fff;
        if id != 0 {
            return id;
        }
    }
}

// ─── Records and bundle ──────────────────────────────────────────────────────

/// A one-time pre-key as persisted in the key store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub public: [u8; 32],
    pub secret: [u8; 32],
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        let pair = KeyPair::generate();
        Self {
            id,
            public: pair.public_bytes(),
            secret: pair.secret_bytes(),
        }
    }

    pub fn key_pair(&self) -> KeyPair {
        KeyPair::from_secret_bytes(self.secret)
    }
}

/// A signed pre-key as persisted in the key store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub public: [u8; 32],
    pub secret: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedPreKeyRecord {
    /// Generate and sign with the identity key. The signature covers the
    /// type-prefixed public key, as it travels in bundles.
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let pair = KeyPair::generate();
        let mut signed = Vec::with_capacity(33);
        signed.push(KEY_TYPE_DJB);
        signed.extend_from_slice(&pair.public_bytes());
        Self {
            id,
            public: pair.public_bytes(),
            secret: pair.secret_bytes(),
            signature: identity.sign(&signed),
        }
    }

    pub fn key_pair(&self) -> KeyPair {
        KeyPair::from_secret_bytes(self.secret)
    }
}

/// A remote party's published key material, as fetched from the server.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub pre_key_id: Option<u32>,
    pub pre_key: Option<[u8; 32]>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_agreement_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(a.agree(&b.public_bytes()), b.agree(&a.public_bytes()));
    }

    // The identity's ed25519 scalar must agree with plain x25519 peers in
    // both directions, otherwise one identity key could not both sign and
    // participate in X3DH.
    #[test]
    fn identity_agreement_matches_montgomery_conversion() {
        let identity = IdentityKeyPair::generate();
        let peer = KeyPair::generate();

        let ours = identity.agree(&peer.public_bytes());
        let mont = identity_dh_public(&identity.public_bytes()).unwrap();
        let theirs = peer.agree(&mont);
        assert_eq!(ours, theirs);
    }

    #[test]
    fn signed_pre_key_verifies() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(7, &identity);

        let mut signed = vec![KEY_TYPE_DJB];
        signed.extend_from_slice(&spk.public);
        assert!(verify_signature(
            &identity.public_bytes(),
            &signed,
            &spk.signature
        ));
        signed[1] ^= 0x01;
        assert!(!verify_signature(
            &identity.public_bytes(),
            &signed,
            &spk.signature
        ));
    }

    #[test]
    fn registration_id_is_14_bits() {
        for _ in 0..32 {
            let id = generate_registration_id();
            assert!(id > 0 && id < 0x4000);
        }
    }

    #[test]
    fn pre_key_record_roundtrips_through_json() {
        let rec = PreKeyRecord::generate(12);
        let blob = serde_json::to_vec(&rec).unwrap();
        let back: PreKeyRecord = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back.id, rec.id);
        assert_eq!(back.public, rec.public);
        assert_eq!(back.key_pair().public_bytes(), rec.public);
    }
}
