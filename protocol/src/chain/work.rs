//! # Proof of Work
//!
//! Targets travel in headers as 32-bit "compact" numbers: an exponent byte
//! followed by a 23-bit mantissa and a sign bit. A header is valid when its
//! hash, read as a little-endian 256-bit integer, does not exceed the
//! target. The work a block represents is the expected number of hashes
//! needed to hit its target, `2^256 / (target + 1)`.

use primitive_types::{U256, U512};

use crate::crypto::Hash;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// Expand compact `bits` into a target. `None` for negative or overflowing
/// encodings.
pub fn target_from_compact(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & MANTISSA_MASK;
    if mantissa == 0 {
        return Some(U256::zero());
    }
    if bits & SIGN_BIT != 0 {
        return None;
    }
    if exponent <= 3 {
        return Some(U256::from(mantissa >> (8 * (3 - exponent))));
    }
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return None;
    }
    Some(U256::from(mantissa) << (8 * (exponent - 3) as usize))
}

/// Encode a target in compact form, rounding down.
pub fn compact_from_target(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3) as usize)).low_u64() as u32
    };
    if compact & SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Work represented by a block with compact target `bits`. Zero for
/// targets that cannot be expanded.
pub fn block_work(bits: u32) -> U256 {
    match target_from_compact(bits) {
        Some(target) if !target.is_zero() => match target.checked_add(U256::one()) {
            Some(denominator) => (!target / denominator) + U256::one(),
            None => U256::one(),
        },
        _ => U256::zero(),
    }
}

/// `true` when `hash` meets `bits` and `bits` is no easier than `limit`.
pub fn check_proof_of_work(hash: &Hash, bits: u32, limit: U256) -> bool {
    match target_from_compact(bits) {
        Some(target) if !target.is_zero() && target <= limit => {
            U256::from_little_endian(hash) <= target
        }
        _ => false,
    }
}

/// The next compact target after a retarget window that took
/// `actual_timespan` seconds against an intended `target_timespan`.
/// The adjustment is clamped to a factor of four either way and never
/// exceeds `limit`.
pub fn retarget(previous_bits: u32, actual_timespan: u64, target_timespan: u64, limit: U256) -> u32 {
    let target_timespan = target_timespan.max(1);
    let actual = actual_timespan.clamp(target_timespan / 4, target_timespan * 4);
    let previous = target_from_compact(previous_bits).unwrap_or(limit);

    let scaled = previous.full_mul(U256::from(actual)) / U512::from(target_timespan);
    let next = U256::try_from(scaled).unwrap_or(limit);
    compact_from_target(next.min(limit))
}
