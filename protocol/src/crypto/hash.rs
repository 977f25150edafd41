//! # Hashing Utilities
//!
//! Two hash functions, each with one job:
//!
//! - **SHA-256d** (`SHA-256(SHA-256(x))`) names blocks and transactions.
//!   It is what the chain's identity scheme is built on and it is not
//!   going to change.
//! - **BLAKE3** keys everything the node invents for itself: account and
//!   registry names, hash-table bucket placement. It is several times faster
//!   and nobody outside the node ever sees these digests.

use sha2::{Digest, Sha256};

/// A 32-byte digest.
pub type Hash = [u8; 32];

/// The all-zero hash: the genesis block's parent and the coinbase outpoint.
pub const NULL_HASH: Hash = [0u8; 32];

/// SHA-256 of `data`.
///
/// ```
/// use keel_protocol::crypto::sha256;
///
/// assert_eq!(sha256(b"keel").len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> Hash {
    let mut output = [0u8; 32];
    output.copy_from_slice(&Sha256::digest(data));
    output
}

/// SHA-256 applied twice. Block and transaction hashes.
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

/// BLAKE3 of `data`.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Parse a 64-character hex string into a hash.
pub fn hash_from_hex(s: &str) -> Result<Hash, hex::FromHexError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(s, &mut hash)?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn double_sha256_is_sha256_twice() {
        let data = b"block header bytes";
        assert_eq!(double_sha256(data), sha256(&sha256(data)));
        assert_ne!(double_sha256(data), sha256(data));
    }

    #[test]
    fn blake3_is_deterministic_and_distinct_from_sha() {
        assert_eq!(blake3_hash(b"alice"), blake3_hash(b"alice"));
        assert_ne!(blake3_hash(b"alice"), blake3_hash(b"bob"));
        assert_ne!(blake3_hash(b"alice"), sha256(b"alice"));
    }

    #[test]
    fn hex_round_trip_and_rejects_short_input() {
        let hash = double_sha256(b"x");
        assert_eq!(hash_from_hex(&hex::encode(hash)).unwrap(), hash);
        assert!(hash_from_hex("abcd").is_err());
    }
}
