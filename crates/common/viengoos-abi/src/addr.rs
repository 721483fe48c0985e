/*!
Capability addresses

An address names a capability slot or object by a bit string of up to
[`ADDR_BITS`] bits: the path taken through the address space. Both the
string (the prefix) and its length (the depth) are packed into one word.
The prefix is stored left aligned, shifted up by one, and a single marker
bit sits directly below its last significant bit:

```text
 63                                    0
 [ prefix (depth bits) | 1 | 0 ... 0 ]
```

The lowest set bit therefore encodes the depth, and everything above it
is the prefix. The all zero word is [`Addr::VOID`].
*/
use core::fmt;

use viengoos_utils::bits::low_mask;

/// Maximum number of significant bits in an address.
pub const ADDR_BITS: u32 = 63;

/// A capability address. See module level documentation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Addr(u64);

assert_eq_size!(u64, Addr);

impl Addr {
    /// The address which names nothing.
    pub const VOID: Addr = Addr(0);

    /// Pack `prefix` and `depth` into an address.
    ///
    /// `prefix` is the left aligned, `ADDR_BITS` wide bit string; only
    /// its top `depth` bits may be set.
    ///
    /// # Panics
    /// If `depth > ADDR_BITS`, if `prefix` does not fit in `ADDR_BITS`
    /// bits or if it has bits set below its depth.
    pub fn new(prefix: u64, depth: u32) -> Addr {
        match Self::try_new(prefix, depth) {
            Some(addr) => addr,
            None => panic!("invalid address: prefix {:#x}, depth {}", prefix, depth),
        }
    }

    /// Checked variant of [`Addr::new`].
    pub fn try_new(prefix: u64, depth: u32) -> Option<Addr> {
        if depth > ADDR_BITS
            || prefix > low_mask(ADDR_BITS)
            || prefix & low_mask(ADDR_BITS - depth) != 0
        {
            return None;
        }
        Some(Addr((prefix << 1) | (1u64 << (ADDR_BITS - depth))))
    }

    /// Build an address from the `depth` low bits of `bits`, that is
    /// from a right aligned bit string.
    pub fn from_bits(bits: u64, depth: u32) -> Addr {
        assert!(depth <= ADDR_BITS, "address depth {} too large", depth);
        assert!(
            bits <= low_mask(depth),
            "{:#x} has bits beyond depth {}",
            bits,
            depth
        );
        Addr::VOID_ROOT.extend(bits, depth)
    }

    /// The zero depth address: the root of an address space.
    pub const VOID_ROOT: Addr = Addr(1u64 << ADDR_BITS);

    pub const fn from_raw(raw: u64) -> Addr {
        Addr(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn is_void(self) -> bool {
        self.0 == 0
    }

    fn assert_not_void(self) {
        assert!(!self.is_void(), "operation on the void address");
    }

    /// Number of significant bits.
    pub fn depth(self) -> u32 {
        self.assert_not_void();
        ADDR_BITS - self.0.trailing_zeros()
    }

    /// The left aligned prefix, with the marker bit removed.
    pub fn prefix(self) -> u64 {
        self.assert_not_void();
        let marker = 1u64 << self.0.trailing_zeros();
        (self.0 & !marker) >> 1
    }

    /// Append the `sub_depth` low bits of `sub_prefix`.
    ///
    /// # Panics
    /// If the resulting depth would exceed [`ADDR_BITS`] or if
    /// `sub_prefix` has bits set at or above `sub_depth`.
    pub fn extend(self, sub_prefix: u64, sub_depth: u32) -> Addr {
        let depth = self.depth();
        assert!(
            depth + sub_depth <= ADDR_BITS,
            "extending {} by {} bits overflows",
            self,
            sub_depth
        );
        assert!(
            sub_prefix <= low_mask(sub_depth),
            "{:#x} does not fit in {} bits",
            sub_prefix,
            sub_depth
        );
        let shift = ADDR_BITS - depth - sub_depth;
        Addr::new(self.prefix() | (sub_prefix << shift), depth + sub_depth)
    }

    /// Remove the last `n` bits.
    ///
    /// # Panics
    /// If `n` exceeds the depth.
    pub fn chop(self, n: u32) -> Addr {
        let depth = self.depth();
        assert!(n <= depth, "cannot chop {} bits from {}", n, self);
        let new_depth = depth - n;
        Addr::new(
            self.prefix() & !low_mask(ADDR_BITS - new_depth),
            new_depth,
        )
    }

    /// The last `width` significant bits, right aligned.
    ///
    /// # Panics
    /// If `width` exceeds the depth.
    pub fn extract(self, width: u32) -> u64 {
        let depth = self.depth();
        assert!(width <= depth, "cannot extract {} bits from {}", width, self);
        (self.prefix() >> (ADDR_BITS - depth)) & low_mask(width)
    }

    /// The `width` significant bits which follow the first `skip` ones,
    /// right aligned. Address translation consumes addresses this way,
    /// most significant bits first.
    ///
    /// # Panics
    /// If `skip + width` exceeds the depth.
    pub fn bits_at(self, skip: u32, width: u32) -> u64 {
        let depth = self.depth();
        assert!(
            skip + width <= depth,
            "bits {}..{} out of range for {}",
            skip,
            skip + width,
            self
        );
        (self.prefix() >> (ADDR_BITS - skip - width)) & low_mask(width)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            write!(f, "VOID")
        } else {
            write!(f, "{:#x}/{}", self.prefix(), self.depth())
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", self)
    }
}

impl From<Addr> for u64 {
    fn from(addr: Addr) -> u64 {
        addr.into_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for depth in 0..=ADDR_BITS {
            let significant = 0x5555_5555_5555_5555u64 & low_mask(ADDR_BITS);
            let prefix = significant & !low_mask(ADDR_BITS - depth);
            let addr = Addr::new(prefix, depth);
            assert_eq!(depth, addr.depth());
            assert_eq!(prefix, addr.prefix());
            assert!(!addr.is_void());
        }
    }

    #[test]
    fn test_invalid_addresses() {
        assert_eq!(None, Addr::try_new(0, 64));
        assert_eq!(None, Addr::try_new(1, 10));
        assert_eq!(None, Addr::try_new(1u64 << 63, 63));
        assert!(Addr::try_new(1, 63).is_some());
    }

    #[test]
    #[should_panic]
    fn test_new_rejects_low_bits() {
        Addr::new(0b1, 4);
    }

    #[test]
    fn test_extend_and_extract() {
        let root = Addr::from_bits(0b1011, 4);
        let extended = root.extend(0b110, 3);
        assert_eq!(7, extended.depth());
        assert_eq!(0b110, extended.extract(3));
        assert_eq!(0b1011_110, extended.extract(7));
        assert_eq!(0b1011, extended.bits_at(0, 4));
        assert_eq!(0b11, extended.bits_at(4, 2));
    }

    #[test]
    fn test_chop_inverts_extend() {
        let base = Addr::from_bits(0xabc, 12);
        for depth in 0..=20 {
            let sub = 0x5_5555 & low_mask(depth);
            assert_eq!(base, base.extend(sub, depth).chop(depth));
        }
        assert_eq!(Addr::VOID_ROOT, base.chop(12));
    }

    #[test]
    #[should_panic]
    fn test_extend_overflow() {
        Addr::from_bits(0, 60).extend(0, 4);
    }

    #[test]
    #[should_panic]
    fn test_extend_rejects_wide_prefix() {
        Addr::VOID_ROOT.extend(0b100, 2);
    }

    #[test]
    #[should_panic]
    fn test_chop_too_much() {
        Addr::from_bits(1, 1).chop(2);
    }

    #[test]
    #[should_panic]
    fn test_extract_too_wide() {
        Addr::from_bits(1, 1).extract(2);
    }

    #[test]
    fn test_void() {
        assert!(Addr::VOID.is_void());
        assert_eq!(0, Addr::VOID.into_raw());
        assert_eq!(Addr::VOID, Addr::default());
        assert_ne!(Addr::VOID, Addr::VOID_ROOT);
        assert_eq!(0, Addr::VOID_ROOT.depth());
    }

    #[test]
    fn test_display() {
        let addr = Addr::from_bits(0b1, 1);
        assert_eq!("0x4000000000000000/1", format!("{}", addr));
        assert_eq!("VOID", format!("{}", Addr::VOID));
    }
}
