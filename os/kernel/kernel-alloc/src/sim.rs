//! Heap-backed "physical RAM" for host tests.
//!
//! Physical address `pa` lives at `base + pa` inside one page-aligned heap
//! buffer, so page tables built by the real code can be walked and written
//! exactly as in the kernel.

extern crate std;

use crate::{BitmapFrameAlloc, PhysMapper, SharedFrameAlloc};
use core::alloc::Layout;
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::sim::SimInterrupts;
use std::boxed::Box;
use std::vec;

/// `frames` × 4 KiB of zeroed memory addressed from physical 0.
pub struct SimPhys {
    base: *mut u8,
    layout: Layout,
}

// SAFETY: the buffer is plain memory owned by this value; concurrent access
// is governed by whoever holds the frames, as with real RAM.
unsafe impl Send for SimPhys {}
unsafe impl Sync for SimPhys {}

impl SimPhys {
    /// # Panics
    /// If the host allocation fails.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames.max(1) * FRAME_SIZE, FRAME_SIZE)
            .expect("simulated RAM layout");
        // SAFETY: non-zero size.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "simulated RAM allocation failed");
        Self { base, layout }
    }

    /// A `SimPhys` that lives for the rest of the test process.
    #[must_use]
    pub fn leaked(frames: usize) -> &'static Self {
        Box::leak(Box::new(Self::new(frames)))
    }

    #[must_use]
    pub const fn frames(&self) -> usize {
        self.layout.size() / FRAME_SIZE
    }

    /// A memory map with everything but frame 0 usable.
    #[must_use]
    pub fn memory_map(&self) -> [MemoryRegion; 1] {
        let size = self.layout.size() as u64;
        [MemoryRegion::usable(FRAME_SIZE as u64, size - FRAME_SIZE as u64)]
    }

    /// A shared, lock-protected allocator over this RAM with leaked storage.
    ///
    /// # Panics
    /// If the memory map has no usable frames.
    #[must_use]
    pub fn shared_alloc(&self) -> &'static SharedFrameAlloc<'static, SimInterrupts> {
        let frames = self.frames();
        let words = vec![0u64; frames.div_ceil(64)].leak();
        let counts = vec![0u16; frames].leak();
        let alloc = BitmapFrameAlloc::new(&self.memory_map(), words, counts)
            .expect("simulated memory map has usable frames");
        Box::leak(Box::new(SharedFrameAlloc::new(alloc)))
    }
}

impl PhysMapper for SimPhys {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let offset = usize::try_from(pa.as_u64()).unwrap_or(usize::MAX);
        assert!(
            offset < self.layout.size(),
            "{pa} outside simulated RAM of {} bytes",
            self.layout.size()
        );
        // SAFETY: in bounds of the buffer.
        VirtualAddress::from_ptr(unsafe { self.base.add(offset) })
    }
}

impl Drop for SimPhys {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { std::alloc::dealloc(self.base, self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameAlloc;
    use kernel_memory_addresses::PhysicalFrame;

    #[test]
    fn frames_are_real_memory() {
        let ram = SimPhys::new(4);
        let f = PhysicalFrame::from_number(2);
        ram.zero_frame(f);
        // SAFETY: frame 2 is inside the buffer and not otherwise borrowed.
        unsafe { ram.frame_bytes(f)[10] = 0xAB };
        ram.copy_frame(f, PhysicalFrame::from_number(3));
        // SAFETY: as above.
        assert_eq!(unsafe { ram.frame_bytes(PhysicalFrame::from_number(3))[10] }, 0xAB);
    }

    #[test]
    fn bootstrap_reserves_its_own_storage() {
        let ram = SimPhys::new(256);
        // SAFETY: the simulated RAM is untouched by anyone else.
        let mut alloc = unsafe { BitmapFrameAlloc::bootstrap(&ram.memory_map(), &ram) }.unwrap();
        assert_eq!(alloc.total_frames(), 255);
        // one bitmap frame plus one refcount frame
        assert_eq!(alloc.free_frames(), 253);
        assert!(alloc.is_used(PhysicalFrame::from_number(1)));
        assert!(alloc.is_used(PhysicalFrame::from_number(2)));
        assert_eq!(alloc.alloc_frame().unwrap().number(), 3);
    }

    #[test]
    #[should_panic(expected = "outside simulated RAM")]
    fn out_of_range_access_panics() {
        let ram = SimPhys::new(1);
        let _ = ram.phys_to_virt(PhysicalAddress::new(0x2000));
    }
}
