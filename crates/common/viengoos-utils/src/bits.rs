use core::ops::{BitAnd, BitOr};

use num::Num;

/// Mask with the low `n` bits set. `n` may be anything up to 64.
#[inline]
pub const fn low_mask(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// Number of significant bits in `value`, that is the 1-based index of
/// the most significant set bit. Zero has no significant bits.
#[inline]
pub const fn significant_bits(value: u64) -> u32 {
    64 - value.leading_zeros()
}

/// Base two logarithm of a power of two, `None` for anything else.
#[inline]
pub const fn exact_log2(value: u64) -> Option<u32> {
    if value != 0 && value.is_power_of_two() {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

/// Round `value` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub fn align_up<T: Num + Copy + BitAnd<Output = T> + BitOr<Output = T>>(value: T, align: T) -> T {
    let align_mask = align - T::one();
    if value & align_mask == T::zero() {
        value
    } else {
        (value | align_mask) + T::one()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_mask() {
        assert_eq!(0, low_mask(0));
        assert_eq!(0b111, low_mask(3));
        assert_eq!(u64::MAX >> 1, low_mask(63));
        assert_eq!(u64::MAX, low_mask(64));
        assert_eq!(u64::MAX, low_mask(70));
    }

    #[test]
    fn test_significant_bits() {
        assert_eq!(0, significant_bits(0));
        assert_eq!(1, significant_bits(1));
        assert_eq!(3, significant_bits(0b101));
        assert_eq!(64, significant_bits(u64::MAX));
    }

    #[test]
    fn test_exact_log2() {
        assert_eq!(Some(0), exact_log2(1));
        assert_eq!(Some(8), exact_log2(256));
        assert_eq!(None, exact_log2(0));
        assert_eq!(None, exact_log2(12));
    }

    #[test]
    fn test_align() {
        assert_eq!(8, align_up(4usize, 8));
        assert_eq!(8, align_up(8usize, 8));
        assert_eq!(16, align_up(9u64, 8));
        assert_eq!(0, align_up(0u32, 4));
    }
}
