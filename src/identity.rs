//! Node identity: an ed25519 key pair that lives for the whole process.
//!
//! The signing key never leaves this module. Other components only see
//! [`Identity::sign`], [`Identity::public_key_bytes`] and the free-standing
//! [`verify`] check used against keys claimed by remote peers.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{PairError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

pub type PublicKeyBytes = [u8; PUBLIC_KEY_LEN];
pub type SignatureBytes = [u8; SIGNATURE_LEN];

pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generates a fresh key pair from the operating system's RNG.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| PairError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn sign(&self, bytes: &[u8]) -> SignatureBytes {
        self.signing_key.sign(bytes).to_bytes()
    }

    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verify(&self, public_key: &[u8], bytes: &[u8], signature: &[u8]) -> bool {
        verify(public_key, bytes, signature)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &short_key(&self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Checks `signature` over `bytes` against a claimed public key. Malformed keys
/// or signatures simply fail verification.
pub fn verify(public_key: &[u8], bytes: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(bytes, &signature).is_ok()
}

/// First bytes of a key in hex, for log lines.
pub fn short_key(key: &[u8]) -> String {
    key.iter().take(6).map(|b| format!("{b:02x}")).collect()
}
