//! Shared cryptographic primitives: X25519 key agreement, HKDF-SHA256 key
//! derivation, and ChaCha20-Poly1305 sealing used by the Sphinx layer.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{MixnodeError, Result};

/// A symmetric key shared between two hops, derived from an X25519 ECDH
/// exchange and stretched through HKDF.
#[derive(Clone)]
pub struct SharedSecret(pub [u8; 32]);

/// Derive the per-hop shared secret: `ECDH(our_secret, their_public)` fed
/// through HKDF-SHA256 with a fixed info string.
pub fn derive_shared_secret(our_secret: &StaticSecret, their_public: &PublicKey) -> SharedSecret {
    let shared_point = our_secret.diffie_hellman(their_public);
    let hk = Hkdf::<Sha256>::new(None, shared_point.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(b"betanet-sphinx-hop-key", &mut okm)
        .expect("32-byte okm is within HKDF-SHA256's output limit");
    SharedSecret(okm)
}

const NONCE: &[u8; 12] = b"betanet-mix0";

/// Seal `plaintext` under `secret`, with `aad` authenticated but not
/// encrypted (used for the packet's version/kind header bytes).
pub fn seal(secret: &SharedSecret, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(secret.0.as_slice().into());
    cipher
        .encrypt(
            Nonce::from_slice(NONCE),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| MixnodeError::Crypto(format!("seal failed: {e}")))
}

pub fn unseal(secret: &SharedSecret, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(secret.0.as_slice().into());
    cipher
        .decrypt(
            Nonce::from_slice(NONCE),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| MixnodeError::Crypto(format!("unseal failed: {e}")))
}
