use crate::addr::Addr;
use crate::addr_trans::{CAPPAGE_SLOTS, CAPPAGE_SLOTS_LOG2};

/// Info from the kernel to the first thread. Names the capabilities the
/// kernel installed in the root cappage, which is the root of the first
/// thread's address space.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootInfo {
    /// The folio holding all of the root objects.
    pub folio: Addr,
    /// Control capability of the root activity.
    pub activity: Addr,
    /// The first thread.
    pub thread: Addr,
    /// The root cappage itself.
    pub aspace: Addr,
    /// A messenger bound to the first thread.
    pub messenger: Addr,
    /// First root cappage slot the kernel left empty.
    pub first_free_slot: u32,
}

impl BootInfo {
    /// Address of slot `index` of the root cappage.
    ///
    /// # Panics
    /// If `index` is not a cappage slot.
    pub fn slot(index: u32) -> Addr {
        assert!((index as usize) < CAPPAGE_SLOTS, "slot {} out of range", index);
        Addr::from_bits(index as u64, CAPPAGE_SLOTS_LOG2)
    }

    /// Root cappage slots available to the first thread.
    pub fn free_slots(&self) -> impl Iterator<Item = Addr> {
        (self.first_free_slot..CAPPAGE_SLOTS as u32).map(BootInfo::slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots() {
        assert_eq!(8, BootInfo::slot(3).depth());
        assert_eq!(3, BootInfo::slot(3).extract(8));
        let info = BootInfo {
            first_free_slot: 250,
            ..Default::default()
        };
        assert_eq!(6, info.free_slots().count());
    }
}
