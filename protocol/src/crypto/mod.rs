//! # Cryptographic Primitives
//!
//! Thin wrappers over audited implementations. Nothing in here is clever,
//! and it should stay that way.
//!
//! - **SHA-256d** for block and transaction identity.
//! - **BLAKE3** for storage bucket placement and name keys.
//! - **Ed25519** for block signatures and pay-to-key outputs.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, double_sha256, sha256, Hash, NULL_HASH};
pub use keys::{KeelKeypair, KeelPublicKey, KeelSignature, KeyError};
