//! Byte-level mutation strategies (§4.3). Each operates directly on a byte
//! buffer with no knowledge of the protocol model.

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteMutator {
    BitFlip,
    ByteFlip,
    Arithmetic,
    InterestingValue,
    Havoc,
    Splice,
}

pub const ALL_NON_SPLICE: [ByteMutator; 5] = [
    ByteMutator::BitFlip,
    ByteMutator::ByteFlip,
    ByteMutator::Arithmetic,
    ByteMutator::InterestingValue,
    ByteMutator::Havoc,
];

const INTERESTING_8: [i64; 6] = [0, 1, -1, 0x7F, 0x80, 0xFF];
const INTERESTING_16: [i64; 6] = [0, 1, -1, 0x7FFF, 0x8000, 0xFFFF];
const INTERESTING_32: [i64; 6] = [0, 1, -1, 0x7FFFFFFF, 0x80000000, 0xFFFFFFFF];

/// Default fraction of a buffer's bits flipped by `bit_flip`.
pub const DEFAULT_BIT_FLIP_RATIO: f64 = 0.01;
/// Default fraction of a buffer's bytes replaced by `byte_flip`.
pub const DEFAULT_BYTE_FLIP_RATIO: f64 = 0.05;

fn flip_bit(byte: &mut u8, bit: u8) {
    *byte ^= 1 << bit;
}

/// Flips `ceil(flip_ratio * 8 * len)` bits (minimum 1) at random positions.
pub fn bit_flip(rng: &mut impl Rng, data: &mut [u8]) {
    bit_flip_with_ratio(rng, data, DEFAULT_BIT_FLIP_RATIO)
}

pub fn bit_flip_with_ratio(rng: &mut impl Rng, data: &mut [u8], flip_ratio: f64) {
    if data.is_empty() {
        return;
    }
    let total_bits = data.len() * 8;
    let count = ((flip_ratio * total_bits as f64).ceil() as usize)
        .max(1)
        .min(total_bits);
    for _ in 0..count {
        let byte_idx = rng.gen_range(0..data.len());
        let bit = rng.gen_range(0..8u8);
        flip_bit(&mut data[byte_idx], bit);
    }
}

/// Replaces `ceil(flip_ratio * len)` bytes (minimum 1) with uniformly random
/// values.
pub fn byte_flip(rng: &mut impl Rng, data: &mut [u8]) {
    byte_flip_with_ratio(rng, data, DEFAULT_BYTE_FLIP_RATIO)
}

pub fn byte_flip_with_ratio(rng: &mut impl Rng, data: &mut [u8], flip_ratio: f64) {
    if data.is_empty() {
        return;
    }
    let count = ((flip_ratio * data.len() as f64).ceil() as usize)
        .max(1)
        .min(data.len());
    for _ in 0..count {
        let idx = rng.gen_range(0..data.len());
        data[idx] = rng.gen();
    }
}

/// Adds a small signed delta (-35..=35) to a randomly chosen 1/2/4-byte
/// window, honoring the window's natural byte order.
pub fn arithmetic(rng: &mut impl Rng, data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let candidates: Vec<usize> = [1usize, 2, 4].into_iter().filter(|w| *w <= data.len()).collect();
    let width = candidates[rng.gen_range(0..candidates.len())];
    let max_start = data.len() - width;
    let start = if max_start == 0 { 0 } else { rng.gen_range(0..=max_start) };
    let delta: i64 = rng.gen_range(-35..=35);
    let window = &mut data[start..start + width];
    let mut value: u64 = 0;
    for &b in window.iter() {
        value = (value << 8) | b as u64;
    }
    let updated = (value as i64).wrapping_add(delta) as u64;
    let mut v = updated;
    for b in window.iter_mut().rev() {
        *b = (v & 0xFF) as u8;
        v >>= 8;
    }
}

/// Overwrites a randomly chosen 1/2/4-byte window with a value drawn from a
/// table of edge-case constants (0, -1, INT_MIN/MAX, ...).
pub fn interesting_value(rng: &mut impl Rng, data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let width = if data.len() >= 4 && rng.gen_bool(0.4) {
        4
    } else if data.len() >= 2 && rng.gen_bool(0.5) {
        2
    } else {
        1
    };
    let max_start = data.len() - width;
    let start = if max_start == 0 { 0 } else { rng.gen_range(0..=max_start) };
    let value: i64 = match width {
        1 => INTERESTING_8[rng.gen_range(0..INTERESTING_8.len())],
        2 => INTERESTING_16[rng.gen_range(0..INTERESTING_16.len())],
        _ => INTERESTING_32[rng.gen_range(0..INTERESTING_32.len())],
    };
    let window = &mut data[start..start + width];
    let mut v = value as u64;
    for b in window.iter_mut().rev() {
        *b = (v & 0xFF) as u8;
        v >>= 8;
    }
}

/// Stacks 2-8 of the other non-splice strategies in sequence.
pub fn havoc(rng: &mut impl Rng, data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let rounds = rng.gen_range(2..=8);
    for _ in 0..rounds {
        match ALL_NON_SPLICE[rng.gen_range(0..4)] {
            ByteMutator::BitFlip => bit_flip(rng, data),
            ByteMutator::ByteFlip => byte_flip(rng, data),
            ByteMutator::Arithmetic => arithmetic(rng, data),
            ByteMutator::InterestingValue => interesting_value(rng, data),
            ByteMutator::Havoc | ByteMutator::Splice => unreachable!(),
        }
    }
}

/// Splices a random contiguous run from `donor` into `data` at a random
/// offset, truncating or extending `data` to fit. Callers must guarantee at
/// least two seeds exist before reaching here; see
/// [`crate::mutate::engine::MutationEngine::new`].
pub fn splice(rng: &mut impl Rng, data: &[u8], donor: &[u8]) -> Vec<u8> {
    if data.is_empty() || donor.is_empty() {
        return data.to_vec();
    }
    let cut = rng.gen_range(0..data.len());
    let donor_cut = rng.gen_range(0..donor.len());
    let mut out = data[..cut].to_vec();
    out.extend_from_slice(&donor[donor_cut..]);
    out
}

pub fn apply(strategy: ByteMutator, rng: &mut impl Rng, data: &mut Vec<u8>) {
    match strategy {
        ByteMutator::BitFlip => bit_flip(rng, data),
        ByteMutator::ByteFlip => byte_flip(rng, data),
        ByteMutator::Arithmetic => arithmetic(rng, data),
        ByteMutator::InterestingValue => interesting_value(rng, data),
        ByteMutator::Havoc => havoc(rng, data),
        ByteMutator::Splice => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn bit_flip_changes_exactly_one_bit() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut data = vec![0u8; 4];
        bit_flip(&mut rng, &mut data);
        let popcount: u32 = data.iter().map(|b| b.count_ones()).sum();
        assert_eq!(popcount, 1);
    }

    #[test]
    fn arithmetic_preserves_length() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut data = vec![0x10, 0x20, 0x30, 0x40];
        let before_len = data.len();
        arithmetic(&mut rng, &mut data);
        assert_eq!(data.len(), before_len);
    }

    #[test]
    fn splice_does_not_panic_on_short_buffers() {
        let mut rng = StdRng::seed_from_u64(3);
        let out = splice(&mut rng, &[1, 2, 3], &[4, 5]);
        assert!(!out.is_empty());
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut data: Vec<u8> = vec![];
        bit_flip(&mut rng, &mut data);
        byte_flip(&mut rng, &mut data);
        arithmetic(&mut rng, &mut data);
        interesting_value(&mut rng, &mut data);
        assert!(data.is_empty());
    }
}
