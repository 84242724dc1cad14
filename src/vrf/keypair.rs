//! VRF keypair wrapper around `schnorrkel`'s verifiable random function.
//!
//! Used by the relay lottery to produce a publicly verifiable draw: the
//! prover signs a seed with its secret key, publishes the proof, and any
//! verifier holding the public key can recompute and check it without
//! learning the secret.

#![cfg(feature = "vrf")]

use rand_core::OsRng;
use schnorrkel::vrf::{VRFPreOut, VRFProof, VRFProofBatchable};
use schnorrkel::{signing_context, Keypair, PublicKey};

use crate::{MixnodeError, Result};

const VRF_CONTEXT: &[u8] = b"betanet-relay-lottery";

/// A VRF proof plus the pseudorandom output it attests to.
///
/// `proof_bytes` is the 64-byte schnorrkel proof followed by the 32-byte
/// VRF preout, which `vrf_verify` requires alongside the proof itself.
#[derive(Debug, Clone)]
pub struct VrfOutput {
    pub proof_bytes: Vec<u8>,
    pub output_bytes: [u8; 32],
}

/// Wraps a schnorrkel keypair for VRF proving and verifying.
pub struct VrfKeyPair {
    keypair: Keypair,
}

impl VrfKeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate_with(OsRng),
        }
    }

    /// Restore a keypair from a previously serialized 64-byte secret.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let keypair = Keypair::from_bytes(bytes)
            .map_err(|e| MixnodeError::Vrf(format!("invalid VRF keypair bytes: {e}")))?;
        Ok(Self { keypair })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.keypair.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    /// Prove the VRF output for `seed`, returning the proof bytes and the
    /// 32-byte pseudorandom output derived from it.
    pub fn prove(&self, seed: &[u8]) -> VrfOutput {
        let ctx = signing_context(VRF_CONTEXT);
        let (io, proof, _) = self.keypair.vrf_sign(ctx.bytes(seed));
        let output_bytes: [u8; 32] = io.make_bytes(b"relay-lottery");
        let mut proof_bytes = proof.to_bytes().to_vec();
        proof_bytes.extend_from_slice(&io.to_preout().to_bytes());
        VrfOutput {
            proof_bytes,
            output_bytes,
        }
    }

    /// Verify that `proof_bytes` over `seed` was produced by `public_key`,
    /// and recover the same pseudorandom output the prover derived.
    pub fn verify(public_key: &[u8; 32], seed: &[u8], proof_bytes: &[u8]) -> Result<[u8; 32]> {
        let public = PublicKey::from_bytes(public_key)
            .map_err(|e| MixnodeError::Vrf(format!("invalid VRF public key: {e}")))?;
        if proof_bytes.len() < 64 {
            return Err(MixnodeError::Vrf("VRF proof bytes too short".to_string()));
        }
        let (proof_part, preout_part) = proof_bytes.split_at(64);
        let proof = VRFProof::from_bytes(proof_part)
            .map_err(|e| MixnodeError::Vrf(format!("invalid VRF proof bytes: {e}")))?;
        let preout = VRFPreOut::from_bytes(preout_part)
            .map_err(|e| MixnodeError::Vrf(format!("invalid VRF preout bytes: {e}")))?;
        let ctx = signing_context(VRF_CONTEXT);

        let (io, _batchable): (_, VRFProofBatchable) = public
            .vrf_verify(ctx.bytes(seed), &preout, &proof)
            .map_err(|e| MixnodeError::Vrf(format!("VRF verification failed: {e}")))?;

        Ok(io.make_bytes(b"relay-lottery"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prove_then_verify_recovers_same_output() {
        let kp = VrfKeyPair::generate();
        let seed = b"draw-seed-1";
        let out = kp.prove(seed);
        let recovered = VrfKeyPair::verify(&kp.public_key(), seed, &out.proof_bytes).unwrap();
        assert_eq!(out.output_bytes, recovered);
    }

    #[test]
    fn verify_rejects_tampered_proof() {
        let kp = VrfKeyPair::generate();
        let seed = b"draw-seed-2";
        let mut out = kp.prove(seed);
        out.proof_bytes[0] ^= 0xFF;
        assert!(VrfKeyPair::verify(&kp.public_key(), seed, &out.proof_bytes).is_err());
    }

    #[test]
    fn same_seed_is_deterministic() {
        let kp = VrfKeyPair::generate();
        let seed = b"draw-seed-3";
        let a = kp.prove(seed);
        let b = kp.prove(seed);
        assert_eq!(a.output_bytes, b.output_bytes);
    }
}
