//! # Page Tables
//!
//! All four levels share one layout: 512 eight-byte entries in a 4 KiB
//! aligned frame. The level only changes how bit 7 is read.

use crate::PageEntryBits;
use core::ops::{Index, IndexMut};
use kernel_alloc::PhysMapper;
use kernel_memory_addresses::PhysicalFrame;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// One page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntryBits {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntryBits) {
        self.entries[i] = e;
    }

    /// Present entries with their index.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

impl Index<usize> for PageTable {
    type Output = PageEntryBits;

    fn index(&self, i: usize) -> &PageEntryBits {
        &self.entries[i]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, i: usize) -> &mut PageEntryBits {
        &mut self.entries[i]
    }
}

/// Borrow the table stored in `frame`.
///
/// # Safety
/// - `frame` must hold a page table reachable through `m`.
/// - No other live reference to the same table may be used while the
///   returned one is.
#[inline]
pub(crate) unsafe fn get_table<'a, M: PhysMapper>(m: &M, frame: PhysicalFrame) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}
