//! Sphinx per-hop packet processor.
//!
//! Wire layout inside a [`Packet`]'s payload:
//!
//! ```text
//! [version:1][ephemeral_pubkey:32][next_hop_flag:1][next_hop:0|6][replay_tag:32][ciphertext...]
//! ```
//!
//! `next_hop_flag = 0` marks a terminal hop (no address follows);
//! `next_hop_flag = 1` is followed by a 4-byte IPv4 address and a 2-byte
//! big-endian port. The version byte occupies the header's reserved
//! region named in spec.md's open question: unsupported versions are
//! rejected as [`SphinxError::Malformed`] rather than negotiated.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, Bytes};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::core::protocol_version::ProtocolVersion;
use crate::crypto::crypto::{derive_shared_secret, unseal};
use crate::MIXNODE_VERSION;

const HEADER_FIXED_LEN: usize = 1 + 32 + 1;
const REPLAY_TAG_LEN: usize = 32;

/// Errors from processing a single Sphinx-layered packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SphinxError {
    #[error("malformed Sphinx packet: {0}")]
    Malformed(String),
    #[error("authentication failed: MAC/AEAD tag mismatch")]
    AuthFailure,
    #[error("replay tag already seen")]
    Replay,
}

impl From<SphinxError> for crate::MixnodeError {
    fn from(e: SphinxError) -> Self {
        crate::MixnodeError::Crypto(e.to_string())
    }
}

/// Where the peeled packet should go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    Forward(SocketAddr),
    Terminal,
}

/// Result of successfully peeling one Sphinx layer.
#[derive(Debug, PartialEq)]
pub struct PeeledLayer {
    pub next_hop: NextHop,
    pub replay_tag: [u8; 32],
    pub inner: Bytes,
}

/// Holds this node's long-term X25519 secret and peels one Sphinx layer
/// per call to [`Self::process`].
pub struct SphinxProcessor {
    secret: StaticSecret,
}

impl SphinxProcessor {
    pub fn new(secret: StaticSecret) -> Self {
        Self { secret }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    /// Peel one onion layer: verify the version byte, derive the shared
    /// secret via ECDH with the embedded ephemeral public key, decrypt and
    /// authenticate the inner payload, and report where it routes next.
    pub fn process(&self, raw: &[u8]) -> Result<PeeledLayer, SphinxError> {
        if raw.len() < HEADER_FIXED_LEN + REPLAY_TAG_LEN {
            return Err(SphinxError::Malformed("packet shorter than fixed header".into()));
        }

        let mut buf = Bytes::copy_from_slice(raw);
        let version = buf.get_u8();
        let parsed_version = ProtocolVersion::decode_byte(version).ok_or_else(|| {
            SphinxError::Malformed(format!("unsupported protocol version byte {version}"))
        })?;
        if parsed_version != ProtocolVersion::V1_2_0 {
            return Err(SphinxError::Malformed(format!(
                "unsupported protocol version {parsed_version}"
            )));
        }

        let mut ephemeral_bytes = [0u8; 32];
        buf.copy_to_slice(&mut ephemeral_bytes);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let next_hop_flag = buf.get_u8();
        let next_hop = match next_hop_flag {
            0 => NextHop::Terminal,
            1 => {
                if buf.len() < 6 + REPLAY_TAG_LEN {
                    return Err(SphinxError::Malformed("truncated next-hop address".into()));
                }
                let mut ip_bytes = [0u8; 4];
                buf.copy_to_slice(&mut ip_bytes);
                let port = buf.get_u16();
                NextHop::Forward(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(ip_bytes),
                    port,
                )))
            }
            other => return Err(SphinxError::Malformed(format!("bad next-hop flag {other}"))),
        };

        if buf.len() < REPLAY_TAG_LEN {
            return Err(SphinxError::Malformed("truncated replay tag".into()));
        }
        let mut replay_tag = [0u8; 32];
        buf.copy_to_slice(&mut replay_tag);

        let shared_secret = derive_shared_secret(&self.secret, &ephemeral_public);
        let aad = [version, next_hop_flag];
        let inner = unseal(&shared_secret, &aad, &buf).map_err(|_| SphinxError::AuthFailure)?;

        Ok(PeeledLayer {
            next_hop,
            replay_tag,
            inner: Bytes::from(inner),
        })
    }
}

/// Derive the replay tag used to key the replay cache: a hash of the
/// ephemeral public key and ciphertext, so resubmitting the same onion
/// layer is always caught regardless of outer framing.
pub fn replay_tag_for(ephemeral_public: &PublicKey, ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ephemeral_public.as_bytes());
    hasher.update(ciphertext);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
