//! # Key Management
//!
//! Ed25519 keys for the two places the chain checks signatures: pay-to-key
//! output scripts and signed (version 2) block headers.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Fresh keys come from `OsRng`.
//! - Key bytes are never logged.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of an encoded signature.
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected {SIGNATURE_LENGTH} bytes")]
    InvalidSignature,
}

/// A signing keypair.
///
/// Deliberately not `Serialize`: writing a private key out should be a
/// conscious `to_bytes()` call, not a side effect of dumping a struct.
pub struct KeelKeypair {
    signing_key: SigningKey,
}

/// The public half of a keypair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeelPublicKey {
    bytes: [u8; 32],
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeelSignature {
    bytes: [u8; SIGNATURE_LENGTH],
}

// ---------------------------------------------------------------------------
// KeelKeypair
// ---------------------------------------------------------------------------

impl KeelKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Handy for tests and for
    /// network-defined keys such as the regtest block signer.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> KeelPublicKey {
        KeelPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> KeelSignature {
        KeelSignature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &KeelSignature) -> bool {
        self.public_key().verify(message, signature)
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl Clone for KeelKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.to_bytes())
    }
}

impl fmt::Debug for KeelKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        f.debug_struct("KeelKeypair")
            .field("public", &self.public_key())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// KeelPublicKey
// ---------------------------------------------------------------------------

impl KeelPublicKey {
    /// Validate and wrap 32 bytes. Rejects encodings that are not curve points.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// `true` when `signature` is valid for `message` under this key.
    pub fn verify(&self, message: &[u8], signature: &KeelSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(&signature.bytes);
        verifying_key.verify(message, &signature).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for KeelPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for KeelPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeelPublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// KeelSignature
// ---------------------------------------------------------------------------

impl KeelSignature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes = slice.try_into().map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.bytes
    }
}

impl fmt::Debug for KeelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.bytes);
        write!(f, "KeelSignature({}...{})", &hex[..8], &hex[120..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeelKeypair::generate();
        let sig = kp.sign(b"block hash");
        assert!(kp.verify(b"block hash", &sig));
        assert!(!kp.verify(b"other hash", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = KeelKeypair::generate();
        let kp2 = KeelKeypair::generate();
        let sig = kp1.sign(b"message");
        assert!(!kp2.verify(b"message", &sig));
    }

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = KeelKeypair::from_seed(&[9u8; 32]);
        let b = KeelKeypair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m").as_bytes(), b.sign(b"m").as_bytes());
        assert_eq!(a.clone().public_key(), a.public_key());
    }

    #[test]
    fn public_key_slice_validation() {
        let kp = KeelKeypair::generate();
        let pk = KeelPublicKey::try_from_slice(kp.public_key().as_bytes()).unwrap();
        assert_eq!(pk, kp.public_key());
        assert!(KeelPublicKey::try_from_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn signature_slice_validation() {
        let sig = KeelKeypair::generate().sign(b"x");
        assert_eq!(KeelSignature::try_from_slice(sig.as_bytes()).unwrap(), sig);
        assert!(KeelSignature::try_from_slice(&[0u8; 63]).is_err());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = KeelKeypair::from_seed(&[0xAB; 32]);
        let debug = format!("{kp:?}");
        assert!(!debug.contains(&hex::encode([0xABu8; 32])));
    }
}
