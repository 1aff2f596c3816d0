//! Host stand-in for the translation hardware.

extern crate std;

use crate::Mmu;
use core::cell::Cell;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

std::thread_local! {
    static ROOT: Cell<u64> = const { Cell::new(0) };
    static INVALIDATIONS: Cell<usize> = const { Cell::new(0) };
    static FLUSHES: Cell<usize> = const { Cell::new(0) };
    static LOADS: Cell<usize> = const { Cell::new(0) };
}

/// Per-thread record of TLB maintenance and root switches.
pub struct SimMmu;

impl SimMmu {
    /// Number of single-page invalidations on this thread.
    #[must_use]
    pub fn invalidations() -> usize {
        INVALIDATIONS.with(Cell::get)
    }

    #[must_use]
    pub fn flushes() -> usize {
        FLUSHES.with(Cell::get)
    }

    /// Number of root switches on this thread.
    #[must_use]
    pub fn loads() -> usize {
        LOADS.with(Cell::get)
    }

    /// Sets the active root without counting a switch (boot adoption).
    pub fn set_current_root(root: PhysicalFrame) {
        ROOT.with(|r| r.set(root.number()));
    }

    pub fn reset() {
        ROOT.with(|c| c.set(0));
        INVALIDATIONS.with(|c| c.set(0));
        FLUSHES.with(|c| c.set(0));
        LOADS.with(|c| c.set(0));
    }
}

impl Mmu for SimMmu {
    fn invalidate_page(_va: VirtualAddress) {
        INVALIDATIONS.with(|c| c.set(c.get() + 1));
    }

    fn flush_all() {
        FLUSHES.with(|c| c.set(c.get() + 1));
    }

    unsafe fn load_root(root: PhysicalFrame) {
        ROOT.with(|r| r.set(root.number()));
        LOADS.with(|c| c.set(c.get() + 1));
    }

    fn current_root() -> PhysicalFrame {
        PhysicalFrame::from_number(ROOT.with(Cell::get))
    }
}
