//! Cryptographic primitives: shared-secret derivation, AEAD sealing, and
//! the Sphinx per-hop packet processor built on top of them.

pub mod crypto;
pub mod sphinx;

pub use crypto::{derive_shared_secret, seal, unseal, SharedSecret};
pub use sphinx::{NextHop, SphinxError, SphinxProcessor};
