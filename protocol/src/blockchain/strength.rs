//! Fork comparison.
//!
//! A reorganization happens only when the fork's blocks above the fork
//! point are strictly stronger than the main chain's blocks above it.
//! What "stronger" means is pluggable; proof-of-work chains compare
//! cumulative work.

use primitive_types::U256;

use crate::chain::work::block_work;
use crate::chain::Header;

pub trait ForkStrength: Send + Sync {
    fn block_strength(&self, header: &Header) -> U256;

    fn strength(&self, headers: &[Header]) -> U256 {
        headers.iter().fold(U256::zero(), |total, header| {
            total.saturating_add(self.block_strength(header))
        })
    }
}

/// Expected hashes to produce each block. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct CumulativeWork;

impl ForkStrength for CumulativeWork {
    fn block_strength(&self, header: &Header) -> U256 {
        block_work(header.bits)
    }
}

/// One per block: the longest chain wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainLength;

impl ForkStrength for ChainLength {
    fn block_strength(&self, _header: &Header) -> U256 {
        U256::one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NULL_HASH;

    fn header(bits: u32) -> Header {
        Header {
            version: 1,
            previous_block_hash: NULL_HASH,
            merkle: NULL_HASH,
            timestamp: 0,
            bits,
            nonce: 0,
            number: 0,
        }
    }

    #[test]
    fn work_favors_harder_blocks() {
        let easy = [header(0x207fffff), header(0x207fffff)];
        let hard = [header(0x1d00ffff)];
        assert!(CumulativeWork.strength(&hard) > CumulativeWork.strength(&easy));
        assert!(ChainLength.strength(&easy) > ChainLength.strength(&hard));
        assert_eq!(ChainLength.strength(&[]), U256::zero());
    }
}
