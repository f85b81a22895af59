//! The Sv39 page table format that address spaces are projected onto.

use bitflags::bitflags;
use core::fmt::{Binary, Debug, Formatter, LowerHex, Write};
use static_assertions::{assert_eq_size, const_assert_eq};

/// How many entries each page table holds
pub const ENTRIES_PER_TABLE: usize = 512;

/// Address bits translated by one page table level
pub const TABLE_INDEX_BITS: u8 = 9;

/// Shape of one level of the Sv39 translation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Level {
    /// log2 of the number of bytes one table of this level covers
    pub l2table: u8,
    /// The hardware level number where 0 holds the 4KiB leaves
    pub level: u8,
    /// log2 of the number of bytes one entry of this level covers
    pub l2slot: u8,
}

/// The levels of an Sv39 translation, starting at the root
pub const LEVELS: [Level; 3] = [
    Level {
        l2table: 39,
        level: 2,
        l2slot: 30,
    },
    Level {
        l2table: 30,
        level: 1,
        l2slot: 21,
    },
    Level {
        l2table: 21,
        level: 0,
        l2slot: 12,
    },
];

impl Level {
    /// The index of the entry translating `va` within a table of this level
    pub const fn index_of(&self, va: u64) -> usize {
        ((va >> self.l2slot) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
    }
}

/// An entry of a [`PageTable`] responsible for mapping virtual to physical addresses.
///
/// # Format
/// ```text
///   63 62  61 60      54 53    28 27    19 18    10 9   8  7   6   5   4   3   2   1   0
/// ┌───┬──────┬──────────┬────────┬────────┬────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┐
/// │ N │ PBMT │ reserved │ PPN[2] │ PPN[1] │ PPN[0] │ RSW │ D │ A │ G │ U │ X │ W │ R │ V │
/// └───┴──────┴──────────┴────────┴────────┴────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┘
///       2bit     7bit     26bit     9bit     9bit   2bit
/// ```
///
/// The two RSW bits are used as [`EntryFlags::Weak`] and [`EntryFlags::SoftValid`].
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(C, align(8))]
pub struct PageTableEntry {
    entry: u64,
}

const PPN_OFFSET: u64 = 10;
const PPN_BITS: u64 = 44;
const PPN_MASK: u64 = ((1 << PPN_BITS) - 1) << PPN_OFFSET;
const PAGE_OFFSET_MASK: u64 = (1 << 12) - 1;

impl PageTableEntry {
    pub const EMPTY: PageTableEntry = PageTableEntry { entry: 0 };

    /// Create an entry pointing at `paddr` with exactly the given flags
    pub fn new(paddr: u64, flags: EntryFlags) -> Self {
        let mut entry = Self::EMPTY;
        entry.set(paddr, flags);
        entry
    }

    /// Whether the hardware uses this entry for translation
    pub fn is_valid(&self) -> bool {
        self.flags().contains(EntryFlags::Valid)
    }

    /// Whether this entry holds anything at all, valid for the hardware or not
    pub fn is_present(&self) -> bool {
        self.flags().intersects(EntryFlags::Valid | EntryFlags::SoftValid)
    }

    /// Whether this is a leaf entry not pointing to further [`PageTable`]s
    pub fn is_leaf(&self) -> bool {
        self.flags().intersects(EntryFlags::RWX)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.entry)
    }

    /// The physical address this entry points to
    pub fn paddr(&self) -> u64 {
        ((self.entry & PPN_MASK) >> PPN_OFFSET) << 12
    }

    /// Point this entry at `paddr` with exactly the given flags
    pub fn set(&mut self, paddr: u64, flags: EntryFlags) {
        assert_eq!(
            paddr & PAGE_OFFSET_MASK,
            0,
            "cannot set page table entry to unaligned paddr {paddr:#x}"
        );
        log::trace!("[pte] setting entry to {paddr:#x} with flags {flags:?}");
        self.entry = (((paddr >> 12) << PPN_OFFSET) & PPN_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(
                f,
                "PageTableEntry {{ addr: {:12x}, flags: {:?} }}",
                self.paddr(),
                self.flags()
            )
        } else {
            f.write_str("PageTableEntry (invalid) { .. }")
        }
    }
}

impl Binary for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.entry, f)
    }
}

impl LowerHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.entry, f)
    }
}

bitflags! {
    /// The flags that can be set on a [`PageTableEntry`]
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// If set, the MMU considers this a valid entry in the page table and uses it for address mapping
        const Valid = 1 << 0;
        /// Allows reading from the mapped page
        const Read = 1 << 1;
        /// Allows writing from the mapped page
        const Write = 1 << 2;
        /// Allows executing code from the mapped page
        const Execute = 1 << 3;
        /// Allows accessing the mapped page **from user mode**
        const User = 1 << 4;
        const Global = 1 << 5;
        /// Set by the MMU when something has read from the page since the mapping was set up
        const Accessed = 1 << 6;
        /// Set by the MMU when something has written to the page since the mapping was set up
        const Dirty = 1 << 7;

        /// The page was reached through a weak capability
        const Weak = 1 << 8;
        /// The entry is installed for software even if the hardware must not use it
        const SoftValid = 1 << 9;

        /// Svpbmt non-cacheable memory type
        const PbmtNc = 1 << 61;

        const RWX = Self::Read.bits() | Self::Write.bits() | Self::Execute.bits();
    }
}

impl Debug for EntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        fn write_bit(
            flags: EntryFlags,
            bit: EntryFlags,
            c: char,
            f: &mut Formatter<'_>,
        ) -> core::fmt::Result {
            if flags.contains(bit) {
                f.write_char(c)
            } else {
                f.write_char(' ')
            }
        }
        write_bit(*self, EntryFlags::PbmtNc, 'N', f)?;
        write_bit(*self, EntryFlags::SoftValid, 'S', f)?;
        write_bit(*self, EntryFlags::Weak, 'K', f)?;
        write_bit(*self, EntryFlags::Dirty, 'D', f)?;
        write_bit(*self, EntryFlags::Accessed, 'A', f)?;
        write_bit(*self, EntryFlags::Global, 'G', f)?;
        write_bit(*self, EntryFlags::User, 'U', f)?;
        write_bit(*self, EntryFlags::Execute, 'X', f)?;
        write_bit(*self, EntryFlags::Write, 'W', f)?;
        write_bit(*self, EntryFlags::Read, 'R', f)?;
        write_bit(*self, EntryFlags::Valid, 'V', f)?;
        Ok(())
    }
}

/// A page table as it is read by the MMU
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

assert_eq_size!(PageTable, [u8; crate::PAGE_SIZE]);
const_assert_eq!(1 << TABLE_INDEX_BITS, ENTRIES_PER_TABLE);

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    pub fn clear(&mut self) {
        self.entries.fill(PageTableEntry::EMPTY);
    }
}
