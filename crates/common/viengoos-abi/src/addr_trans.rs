/*!
Capability address translation descriptors

Every capability carries a guard and a subpage selector which take part
in the address space walk:

* The guard is a bit string of `gdepth` bits which must match the next
  bits of the address being translated before translation continues. A
  guard stands in for a chain of single child cappages.
* The subpage selector lets one physical cappage be seen as `subpages`
  disjoint logical tables of `256 / subpages` slots each. A capability
  designates table number `subpage`.

Guard and subpage are packed together into [`GUARD_SUBPAGE_BITS`] bits,
the subpage occupying the low `log2(subpages)` bits.
*/
use viengoos_utils::bits::{exact_log2, low_mask, significant_bits};

/// Width of the combined guard and subpage encoding.
pub const GUARD_SUBPAGE_BITS: u32 = 22;
/// log2 of the number of slots in a cappage.
pub const CAPPAGE_SLOTS_LOG2: u32 = 8;
/// Number of capability slots in a cappage.
pub const CAPPAGE_SLOTS: usize = 1 << CAPPAGE_SLOTS_LOG2;
/// Largest supported number of subpages in a cappage.
pub const MAX_SUBPAGES: u32 = 1 << CAPPAGE_SLOTS_LOG2;

/// Guard and subpage descriptor. See module level documentation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapAddrTrans {
    guard_subpage: u32,
    gdepth: u8,
    subpages_log2: u8,
}

impl CapAddrTrans {
    /// A descriptor with no guard and a single subpage.
    pub const IDENTITY: CapAddrTrans = CapAddrTrans {
        guard_subpage: 0,
        gdepth: 0,
        subpages_log2: 0,
    };

    /// Build a descriptor, or `None` if the combination is not encodable.
    pub fn new(guard: u64, gdepth: u32, subpage: u32, subpages: u32) -> Option<CapAddrTrans> {
        let mut trans = Self::IDENTITY;
        if trans.set_guard_subpage(guard, gdepth, subpage, subpages) {
            Some(trans)
        } else {
            None
        }
    }

    /// Set guard and subpage together.
    ///
    /// Fails, leaving the descriptor untouched, unless `subpages` is a
    /// power of two no larger than 256, `subpage < subpages`, `guard`
    /// fits in `gdepth` bits and `gdepth + log2(subpages)` fits the
    /// combined encoding.
    pub fn set_guard_subpage(&mut self, guard: u64, gdepth: u32, subpage: u32, subpages: u32) -> bool {
        let subpages_log2 = match exact_log2(subpages as u64) {
            Some(log2) if subpages <= MAX_SUBPAGES => log2,
            _ => return false,
        };
        let fits = gdepth
            .checked_add(subpages_log2)
            .map_or(false, |bits| bits <= GUARD_SUBPAGE_BITS);
        if subpage >= subpages || significant_bits(guard) > gdepth || !fits {
            return false;
        }

        self.guard_subpage = ((guard as u32) << subpages_log2) | subpage;
        self.gdepth = gdepth as u8;
        self.subpages_log2 = subpages_log2 as u8;
        true
    }

    /// Replace the guard, keeping the subpage.
    pub fn set_guard(&mut self, guard: u64, gdepth: u32) -> bool {
        self.set_guard_subpage(guard, gdepth, self.subpage(), self.subpages())
    }

    /// Replace the subpage, keeping the guard.
    pub fn set_subpage(&mut self, subpage: u32, subpages: u32) -> bool {
        self.set_guard_subpage(self.guard(), self.guard_bits(), subpage, subpages)
    }

    pub fn subpages(&self) -> u32 {
        1 << self.subpages_log2
    }

    pub fn subpages_log2(&self) -> u32 {
        self.subpages_log2 as u32
    }

    pub fn subpage(&self) -> u32 {
        self.guard_subpage & low_mask(self.subpages_log2 as u32) as u32
    }

    /// Number of slots in the designated subpage.
    pub fn subpage_size(&self) -> u32 {
        MAX_SUBPAGES >> self.subpages_log2
    }

    /// Address bits consumed when indexing the designated subpage.
    pub fn subpage_size_log2(&self) -> u32 {
        CAPPAGE_SLOTS_LOG2 - self.subpages_log2 as u32
    }

    /// Index of the first slot of the designated subpage.
    pub fn subpage_offset(&self) -> u32 {
        self.subpage() * self.subpage_size()
    }

    pub fn guard(&self) -> u64 {
        (self.guard_subpage >> self.subpages_log2) as u64
    }

    pub fn guard_bits(&self) -> u32 {
        self.gdepth as u32
    }

    /// Structural validity of a descriptor which did not come through
    /// [`CapAddrTrans::set_guard_subpage`], for instance one decoded
    /// from a message.
    pub fn valid(&self) -> bool {
        self.gdepth as u32 <= u64::BITS
            && self.subpages_log2 as u32 <= CAPPAGE_SLOTS_LOG2
            && significant_bits(self.guard()) <= self.gdepth as u32
    }

    /// Whether the subpage window of `self` lies within that of `outer`.
    pub fn subpage_within(&self, outer: &CapAddrTrans) -> bool {
        let start = self.subpage_offset();
        let end = start + self.subpage_size();
        let outer_start = outer.subpage_offset();
        let outer_end = outer_start + outer.subpage_size();
        outer_start <= start && end <= outer_end
    }

    /// Pack into a word for marshalling.
    pub fn to_raw(&self) -> u64 {
        self.guard_subpage as u64 | (self.gdepth as u64) << 32 | (self.subpages_log2 as u64) << 40
    }

    /// Unpack a marshalled descriptor, rejecting anything not encodable.
    pub fn from_raw(raw: u64) -> Option<CapAddrTrans> {
        let trans = CapAddrTrans {
            guard_subpage: raw as u32,
            gdepth: (raw >> 32) as u8,
            subpages_log2: (raw >> 40) as u8,
        };
        if raw >> 48 != 0
            || trans.guard_subpage as u64 > low_mask(GUARD_SUBPAGE_BITS)
            || !trans.valid()
        {
            return None;
        }
        Some(trans)
    }
}

impl core::fmt::Debug for CapAddrTrans {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "CapAddrTrans(guard {:#x}/{}, subpage {}/{})",
            self.guard(),
            self.guard_bits(),
            self.subpage(),
            self.subpages()
        )
    }
}
