/*!
Message buffers

A message occupies exactly one page:

```text
 offset 0   u16  cap_count
 offset 2   u16  data_count
 offset 8   Addr caps[cap_count]
            u8   data[data_count]
```

All integers are little endian. The capability array starts at the
header rounded up to the alignment of an address. Data follows the
capability array directly, so appending a capability moves the data up.

The count fields are untrusted: a message may arrive from anyone. The
accessors clamp them to what fits in the page, so a corrupt header never
causes an out of bounds access. Mutators check for room before writing
anything and panic if there is none; use [`Message::fits`] first when
the sizes are not known to be good.
*/
use core::fmt;
use core::mem::{align_of, size_of};

use viengoos_utils::bits::align_up;

use crate::{addr::Addr, SetDefault, PAGESIZE};

const WORD: usize = size_of::<u64>();
const ADDR: usize = size_of::<Addr>();

/// A page sized message buffer. See module level documentation.
#[derive(Clone)]
#[repr(C, align(8))]
pub struct Message {
    raw: [u8; PAGESIZE],
}

assert_eq_size!([u8; PAGESIZE], Message);

impl Message {
    /// A message with no capabilities and no data.
    pub const fn new() -> Self {
        Self { raw: [0; PAGESIZE] }
    }

    /// Copy a message out of a page.
    pub fn from_bytes(bytes: &[u8; PAGESIZE]) -> Self {
        Self { raw: *bytes }
    }

    pub fn as_bytes(&self) -> &[u8; PAGESIZE] {
        &self.raw
    }

    /// Offset of the capability array.
    pub fn caps_offset() -> usize {
        align_up(2 * size_of::<u16>(), align_of::<Addr>())
    }

    /// Largest number of capabilities a message can hold.
    pub fn max_caps() -> usize {
        (PAGESIZE - Self::caps_offset()) / ADDR
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.raw[offset], self.raw[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.raw[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set_counts(&mut self, caps: usize, data: usize) {
        self.write_u16(0, caps as u16);
        self.write_u16(2, data as u16);
    }

    /// Number of capability addresses, clamped to what fits.
    pub fn cap_count(&self) -> usize {
        (self.read_u16(0) as usize).min(Self::max_caps())
    }

    /// Number of data bytes, clamped to what fits after the capabilities.
    pub fn data_count(&self) -> usize {
        let room = PAGESIZE - self.data_offset();
        (self.read_u16(2) as usize).min(room)
    }

    fn data_offset(&self) -> usize {
        Self::caps_offset() + self.cap_count() * ADDR
    }

    /// Bytes still free in the page.
    pub fn remaining(&self) -> usize {
        PAGESIZE - self.data_offset() - self.data_count()
    }

    /// Whether `caps` more capabilities and `bytes` more data bytes fit.
    pub fn fits(&self, caps: usize, bytes: usize) -> bool {
        caps * ADDR + bytes <= self.remaining()
    }

    pub fn clear(&mut self) {
        self.set_counts(0, 0);
    }

    pub fn cap(&self, index: usize) -> Addr {
        assert!(
            index < self.cap_count(),
            "capability {} out of range ({})",
            index,
            self.cap_count()
        );
        let offset = Self::caps_offset() + index * ADDR;
        let mut bytes = [0u8; ADDR];
        bytes.copy_from_slice(&self.raw[offset..offset + ADDR]);
        Addr::from_raw(u64::from_le_bytes(bytes))
    }

    /// Overwrite an existing capability address.
    pub fn cap_set(&mut self, index: usize, addr: Addr) {
        assert!(
            index < self.cap_count(),
            "capability {} out of range ({})",
            index,
            self.cap_count()
        );
        let offset = Self::caps_offset() + index * ADDR;
        self.raw[offset..offset + ADDR].copy_from_slice(&addr.into_raw().to_le_bytes());
    }

    pub fn caps(&self) -> impl Iterator<Item = Addr> + '_ {
        (0..self.cap_count()).map(move |index| self.cap(index))
    }

    pub fn data(&self) -> &[u8] {
        let start = self.data_offset();
        &self.raw[start..start + self.data_count()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.data_offset();
        let end = start + self.data_count();
        &mut self.raw[start..end]
    }

    /// Number of whole words of data.
    pub fn word_count(&self) -> usize {
        self.data_count() / WORD
    }

    pub fn word(&self, index: usize) -> u64 {
        assert!(
            index < self.word_count(),
            "word {} out of range ({})",
            index,
            self.word_count()
        );
        let start = index * WORD;
        let mut bytes = [0u8; WORD];
        bytes.copy_from_slice(&self.data()[start..start + WORD]);
        u64::from_le_bytes(bytes)
    }

    pub fn words(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.word_count()).map(move |index| self.word(index))
    }

    /// Append capability addresses, moving the data up to make room.
    ///
    /// # Panics
    /// If the page has no room for them.
    pub fn append_caps(&mut self, caps: &[Addr]) {
        assert!(
            self.fits(caps.len(), 0),
            "no room for {} capabilities ({} bytes free)",
            caps.len(),
            self.remaining()
        );
        let cap_count = self.cap_count();
        let data_count = self.data_count();
        let data_start = self.data_offset();
        let shift = caps.len() * ADDR;

        self.raw
            .copy_within(data_start..data_start + data_count, data_start + shift);
        for (i, addr) in caps.iter().enumerate() {
            let offset = data_start + i * ADDR;
            self.raw[offset..offset + ADDR].copy_from_slice(&addr.into_raw().to_le_bytes());
        }
        self.set_counts(cap_count + caps.len(), data_count);
    }

    pub fn append_cap(&mut self, cap: Addr) {
        self.append_caps(&[cap]);
    }

    /// Append data bytes.
    ///
    /// # Panics
    /// If the page has no room for them.
    pub fn append_data(&mut self, data: &[u8]) {
        assert!(
            self.fits(0, data.len()),
            "no room for {} data bytes ({} bytes free)",
            data.len(),
            self.remaining()
        );
        let cap_count = self.cap_count();
        let data_count = self.data_count();
        let start = self.data_offset() + data_count;
        self.raw[start..start + data.len()].copy_from_slice(data);
        self.set_counts(cap_count, data_count + data.len());
    }

    pub fn append_word(&mut self, word: u64) {
        self.append_data(&word.to_le_bytes());
    }

    /// Set data word `index`, growing the data (zero filled) to cover it.
    ///
    /// # Panics
    /// If the word lies beyond the page.
    pub fn word_set(&mut self, index: usize, word: u64) {
        let end = (index + 1) * WORD;
        let data_count = self.data_count();
        if end > data_count {
            let grow = end - data_count;
            assert!(
                self.fits(0, grow),
                "word {} lies beyond the message buffer",
                index
            );
            let start = self.data_offset() + data_count;
            for byte in &mut self.raw[start..start + grow] {
                *byte = 0;
            }
            let cap_count = self.cap_count();
            self.set_counts(cap_count, end);
        }
        let start = self.data_offset() + index * WORD;
        self.raw[start..start + WORD].copy_from_slice(&word.to_le_bytes());
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl SetDefault for Message {
    fn set_default(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("cap_count", &self.cap_count())
            .field("data_count", &self.data_count())
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.cap_count() == other.cap_count()
            && self.data() == other.data()
            && self.caps().eq(other.caps())
    }
}
