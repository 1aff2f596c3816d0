//! # Kernel Stacks
//!
//! Every process but the kernel process owns a [`KERNEL_STACK_SIZE`] stack
//! of physically contiguous frames. The kernel reaches it through the direct
//! map; a process with its own address space additionally sees it at the
//! fixed window below [`KERNEL_STACK_TOP`](kernel_info::memory::KERNEL_STACK_TOP),
//! which is where it runs on.
//!
//! ```text
//!  top ┌──────────────────────────────┐
//!      │ seeded frames (see context)  │
//!      │ ...                          │
//!      │ free stack, grows down       │
//!      │ ...                          │
//!      ├──────────────────────────────┤ base + 64
//!      │ 8 × 0xDEAD_BEEF_DEAD_BEEF    │ guard
//! base └──────────────────────────────┘
//! ```
//!
//! The guard is not a hardware guard page; it is compared before every
//! switch away from the owner, so an overflow is caught at the next switch.

use crate::context::{SwitchFrame, TrapFrame};
use core::mem::size_of;
use kernel_alloc::{FrameAlloc, FrameAllocError, PhysMapper};
use kernel_info::memory::{KERNEL_STACK_PAGES, KERNEL_STACK_SIZE};
use kernel_info::sched::{STACK_GUARD_PATTERN, STACK_GUARD_WORDS};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

const SWITCH_FRAME_SIZE: usize = size_of::<SwitchFrame>();
const TRAP_FRAME_SIZE: usize = size_of::<TrapFrame>();

/// A process's kernel stack, identified by its lowest frame.
#[derive(Debug, Eq, PartialEq)]
pub struct KernelStack {
    base: PhysicalFrame,
}

impl KernelStack {
    /// Allocates and zeroes a stack and writes its guard.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no contiguous run is free.
    pub fn allocate<M: PhysMapper, A: FrameAlloc>(
        mapper: &M,
        alloc: &mut A,
    ) -> Result<Self, FrameAllocError> {
        let base = alloc.alloc_frames(KERNEL_STACK_PAGES)?;
        let stack = Self { base };
        for frame in stack.frames() {
            mapper.zero_frame(frame);
        }
        stack.write_guard(mapper);
        Ok(stack)
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalFrame {
        self.base
    }

    /// The frames backing the stack, lowest first.
    pub fn frames(&self) -> impl Iterator<Item = PhysicalFrame> + use<> {
        let base = self.base;
        (0..KERNEL_STACK_PAGES as u64).map(move |n| base.add(n))
    }

    /// One past the highest byte, as seen through the direct map.
    #[must_use]
    pub fn direct_top<M: PhysMapper>(&self, mapper: &M) -> VirtualAddress {
        mapper.phys_to_virt(self.base.base()) + KERNEL_STACK_SIZE as u64
    }

    /// Physical address `below` bytes under the top.
    fn below_top(&self, below: usize) -> PhysicalAddress {
        self.base.base() + (KERNEL_STACK_SIZE - below) as u64
    }

    /// # Safety
    /// The stack must be owned and not in use; `T` must fit below the top.
    unsafe fn write_below_top<M: PhysMapper, T>(&self, mapper: &M, below: usize, value: T) {
        // SAFETY: forwarded; offsets are multiples of eight.
        unsafe { *mapper.phys_to_mut::<T>(self.below_top(below)) = value };
    }

    /// # Safety
    /// Nothing may be writing the stack.
    #[cfg(test)]
    pub(crate) unsafe fn read_below_top<M: PhysMapper, T: Copy>(&self, mapper: &M, below: usize) -> T {
        // SAFETY: forwarded.
        unsafe { *mapper.phys_to_mut::<T>(self.below_top(below)) }
    }

    /// Fill the guard words.
    pub fn write_guard<M: PhysMapper>(&self, mapper: &M) {
        // SAFETY: the lowest words of an owned stack.
        let guard = unsafe { mapper.phys_to_mut::<[u64; STACK_GUARD_WORDS]>(self.base.base()) };
        guard.fill(STACK_GUARD_PATTERN);
    }

    /// Whether all guard words still hold the pattern.
    #[must_use]
    pub fn guard_intact<M: PhysMapper>(&self, mapper: &M) -> bool {
        // SAFETY: only read.
        let guard = unsafe { mapper.phys_to_mut::<[u64; STACK_GUARD_WORDS]>(self.base.base()) };
        guard.iter().all(|w| *w == STACK_GUARD_PATTERN)
    }

    /// Prepares a fresh kernel task: the first switch to it "returns" into
    /// `entry` with interrupts enabled and a call-aligned stack.
    ///
    /// `top` is the address the stack is executed at. Returns the initial
    /// saved stack pointer.
    pub fn seed_entry<M: PhysMapper>(&self, mapper: &M, top: VirtualAddress, entry: u64, rflags: u64) -> u64 {
        let frame = SwitchFrame {
            rflags,
            rip: entry,
            ..SwitchFrame::default()
        };
        // A zero return address above the frame keeps `rsp + 8` 16-byte
        // aligned at `entry`, as after a `call`.
        let depth = 8 + SWITCH_FRAME_SIZE;
        // SAFETY: a stack nobody runs on yet.
        unsafe {
            self.write_below_top(mapper, 8, 0u64);
            self.write_below_top(mapper, depth, frame);
        }
        top.as_u64() - depth as u64
    }

    /// Prepares a stack that leaves for user mode by replaying `trap`
    /// through the `trap_return` trampoline.
    ///
    /// Returns the initial saved stack pointer relative to `top`.
    pub fn seed_trap_return<M: PhysMapper>(
        &self,
        mapper: &M,
        top: VirtualAddress,
        trap: &TrapFrame,
        trap_return: u64,
    ) -> u64 {
        let frame = SwitchFrame {
            // Interrupts stay off until `iretq` loads the user flags.
            rflags: 0x2,
            rip: trap_return,
            ..SwitchFrame::default()
        };
        let depth = TRAP_FRAME_SIZE + SWITCH_FRAME_SIZE;
        // SAFETY: a stack nobody runs on yet.
        unsafe {
            self.write_below_top(mapper, TRAP_FRAME_SIZE, *trap);
            self.write_below_top(mapper, depth, frame);
        }
        top.as_u64() - depth as u64
    }

    /// Drops the stack's reference to its frames.
    pub fn free<A: FrameAlloc>(self, alloc: &mut A) {
        alloc.free_frames(self.base, KERNEL_STACK_PAGES);
    }
}
