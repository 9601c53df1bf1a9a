//! Bitpacking compression.
//!
//! Values are packed as unsigned deltas from a frame-of-reference
//! minimum, using any width from 0 to 64 bits. Width 0 encodes a
//! constant run: every value equals the minimum.

use std::mem;

/// Data type that supports bitpacking.
/// constant ZERO is used to unify both bitpacking and FOR+bitpacking.
pub trait BitPackable: Copy {
    const ZERO: Self;
    const BITS: usize;

    /// Returns self - min as unsigned delta.
    fn offset_from(self, min: Self) -> u64;

    /// Returns min + delta, inverse of offset_from.
    fn offset_add(min: Self, delta: u64) -> Self;
}

macro_rules! impl_bit_packable {
    ($($t:ty),*) => {
        $(
            impl BitPackable for $t {
                const ZERO: Self = 0;
                const BITS: usize = mem::size_of::<$t>() * 8;

                #[inline(always)]
                fn offset_from(self, min: Self) -> u64 {
                    self.wrapping_sub(min) as u64
                }

                #[inline(always)]
                fn offset_add(min: Self, delta: u64) -> Self {
                    min.wrapping_add(delta as Self)
                }
            }
        )*
    }
}

impl_bit_packable!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

/// Returns number of bits required to pack values in range [min, max].
#[inline]
pub fn width_for<T: BitPackable>(min: T, max: T) -> usize {
    let delta = max.offset_from(min);
    64 - delta.leading_zeros() as usize
}

/// Returns number of bits and minimum value on input data.
/// Returns None if packing saves no space.
#[inline]
pub fn prepare_for_bitpacking<T: BitPackable + Ord>(input: &[T]) -> Option<(usize, T)> {
    if input.is_empty() {
        return Some((0, T::ZERO));
    }
    let mut min = input[0];
    let mut max = input[0];
    input.iter().for_each(|v| {
        min = min.min(*v);
        max = max.max(*v);
    });
    let n_bits = width_for(min, max);
    if n_bits >= T::BITS {
        // compression is meaningless.
        return None;
    }
    Some((n_bits, min))
}

/// Pack values as n_bits-wide deltas from min, LSB first.
/// Out must be zero-filled and large enough.
/// User has to guarantee all deltas fit in n_bits.
#[inline]
pub fn pack_values<T: BitPackable>(input: &[T], min: T, n_bits: usize, out: &mut [u8]) {
    debug_assert!(n_bits <= 64);
    debug_assert!(out.len() * 8 >= input.len() * n_bits);
    if n_bits == 0 {
        return;
    }
    if n_bits % 8 == 0 {
        // byte-aligned fast path.
        let n_bytes = n_bits / 8;
        for (i, v) in input.iter().enumerate() {
            let delta = v.offset_from(min).to_le_bytes();
            out[i * n_bytes..(i + 1) * n_bytes].copy_from_slice(&delta[..n_bytes]);
        }
        return;
    }
    let mask = (1u128 << n_bits) - 1;
    let mut acc: u128 = 0;
    let mut acc_bits = 0usize;
    let mut out_idx = 0usize;
    for v in input {
        acc |= (v.offset_from(min) as u128 & mask) << acc_bits;
        acc_bits += n_bits;
        while acc_bits >= 8 {
            out[out_idx] = acc as u8;
            out_idx += 1;
            acc >>= 8;
            acc_bits -= 8;
        }
    }
    if acc_bits > 0 {
        out[out_idx] = acc as u8;
    }
}

/// Unpack res.len() values packed by [`pack_values`].
/// Compressed element count is supposed to be greater or equal to result count.
#[inline]
pub fn unpack_values<T: BitPackable>(input: &[u8], min: T, n_bits: usize, res: &mut [T]) {
    debug_assert!(n_bits <= 64);
    debug_assert!(input.len() * 8 >= res.len() * n_bits);
    if n_bits == 0 {
        res.fill(min);
        return;
    }
    if n_bits % 8 == 0 {
        // byte-aligned fast path.
        let n_bytes = n_bits / 8;
        for (i, slot) in res.iter_mut().enumerate() {
            let mut delta = [0u8; 8];
            delta[..n_bytes].copy_from_slice(&input[i * n_bytes..(i + 1) * n_bytes]);
            *slot = T::offset_add(min, u64::from_le_bytes(delta));
        }
        return;
    }
    let mask = (1u128 << n_bits) - 1;
    let mut acc: u128 = 0;
    let mut acc_bits = 0usize;
    let mut in_idx = 0usize;
    for slot in res.iter_mut() {
        while acc_bits < n_bits {
            acc |= (input[in_idx] as u128) << acc_bits;
            in_idx += 1;
            acc_bits += 8;
        }
        *slot = T::offset_add(min, (acc & mask) as u64);
        acc >>= n_bits;
        acc_bits -= n_bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn roundtrip<T: BitPackable + Ord + std::fmt::Debug>(input: &[T], min: T, n_bits: usize) {
        let mut packed = vec![0u8; (input.len() * n_bits).div_ceil(8)];
        pack_values(input, min, n_bits, &mut packed);
        let mut res = vec![T::ZERO; input.len()];
        unpack_values(&packed, min, n_bits, &mut res);
        assert_eq!(res, input);
    }

    #[test]
    fn test_width_for() {
        assert_eq!(width_for(5u64, 5), 0);
        assert_eq!(width_for(4u64, 5), 1);
        assert_eq!(width_for(0u64, 255), 8);
        assert_eq!(width_for(0u64, 256), 9);
        assert_eq!(width_for(-8i64, 7), 4);
        assert_eq!(width_for(0u64, u64::MAX), 64);
    }

    #[test]
    fn test_prepare_for_bitpacking() {
        assert_eq!(prepare_for_bitpacking::<u64>(&[]), Some((0, 0)));
        assert_eq!(prepare_for_bitpacking(&[9u64, 9, 9]), Some((0, 9)));
        assert_eq!(prepare_for_bitpacking(&[3u64, 10]), Some((3, 3)));
        assert_eq!(prepare_for_bitpacking(&[-100i64, 155]), Some((8, -100)));
        // full-width range saves nothing.
        assert!(prepare_for_bitpacking(&[0u8, 255]).is_none());
        assert!(prepare_for_bitpacking(&[0u64, u64::MAX]).is_none());
    }

    #[test]
    fn test_pack_unaligned_widths() {
        let input: Vec<u64> = (0..1000).map(|i| 100 + i % 7).collect();
        roundtrip(&input, 100, 3);
        let input: Vec<u64> = (0..1000).map(|i| i % 31).collect();
        roundtrip(&input, 0, 5);
        let input: Vec<u32> = (0..513).map(|i| i % 127).collect();
        roundtrip(&input, 0, 7);
        let input: Vec<u64> = (0..100).map(|i| i * 1001).collect();
        roundtrip(&input, 0, 17);
    }

    #[test]
    fn test_pack_aligned_widths() {
        let input: Vec<u64> = (0..300).collect();
        roundtrip(&input, 0, 16);
        let input: Vec<u64> = (0..300).map(|i| i * 1_000_000).collect();
        roundtrip(&input, 0, 32);
        let input: Vec<u64> = vec![u64::MAX, 0, 42];
        roundtrip(&input, 0, 64);
        let input: Vec<u8> = (0..=255).collect();
        roundtrip(&input, 0, 8);
    }

    #[test]
    fn test_pack_constant() {
        let input = vec![77u64; 500];
        roundtrip(&input, 77, 0);
    }

    #[test]
    fn test_pack_signed() {
        let input = vec![-10i64, -3, 0, 1, 5, 8];
        roundtrip(&input, -10, 5);
        let input: Vec<i32> = (-512..512).collect();
        roundtrip(&input, -512, 10);
    }

    #[test]
    fn test_pack_random_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(0u64);
        for n_bits in [1usize, 2, 3, 9, 11, 13, 21, 33, 63] {
            let max_delta = if n_bits == 64 {
                u64::MAX
            } else {
                (1u64 << n_bits) - 1
            };
            let min = rng.random_range(0..1u64 << 20);
            let input: Vec<u64> = (0..2048)
                .map(|_| min + rng.random_range(0..=max_delta))
                .collect();
            roundtrip(&input, min, n_bits);
        }
    }
}
