//! Delta signatures. Each chain signs with an Ed25519 key derived from its
//! recorded seed, so replays regenerate the same key without storing secrets.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hol_cbor::Hash;

use crate::seed::Seed;

#[derive(Clone)]
pub struct ChainSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ChainSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSigner")
            .field("verifying_key", &hex::encode(self.verifying_key_bytes()))
            .finish()
    }
}

impl ChainSigner {
    pub fn from_seed(seed: &Seed) -> Self {
        let secret = Hash::of_parts(&[b"hol/signing-key", seed.as_bytes()]);
        Self {
            key: SigningKey::from_bytes(secret.as_bytes()),
        }
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Ed25519 over the 32-byte delta hash.
    pub fn sign(&self, delta_hash: &Hash) -> Vec<u8> {
        self.key.sign(delta_hash.as_bytes()).to_bytes().to_vec()
    }
}

pub fn verify_signature(verifying_key: &[u8; 32], delta_hash: &Hash, signature: &[u8]) -> Result<(), String> {
    let key = VerifyingKey::from_bytes(verifying_key).map_err(|e| format!("bad verifying key: {e}"))?;
    let bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| format!("signature must be 64 bytes, got {}", signature.len()))?;
    key.verify(delta_hash.as_bytes(), &Signature::from_bytes(&bytes))
        .map_err(|e| format!("signature rejected: {e}"))
}
