//! Host stand-in for the CPU side of scheduling.
//!
//! [`SimArch`] never leaves the calling thread: a "switch" only records the
//! target and loads the new root into [`SimMmu`]. The scheduler's
//! bookkeeping runs for real, so tests drive it call by call and observe
//! which process it considers current.

extern crate std;

use crate::Arch;
use crate::context::FpuState;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_sync::InterruptControl;
use kernel_sync::sim::SimInterrupts;
use kernel_vmem::Mmu;
use kernel_vmem::sim::SimMmu;
use std::vec::Vec;

std::thread_local! {
    static SWITCHES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    static RSP0: Cell<u64> = const { Cell::new(0) };
    static LIVE_FPU: RefCell<FpuState> = const { RefCell::new(FpuState::new()) };
}

/// Recording CPU. Interrupt masking is [`SimInterrupts`], paging [`SimMmu`].
pub struct SimArch;

impl SimArch {
    /// Address reported for the user-entry trampoline.
    pub const TRAP_RETURN: u64 = 0xffff_ffff_8000_7000;

    /// Incoming stack pointers of every switch on this thread, in order.
    #[must_use]
    pub fn switches() -> Vec<u64> {
        SWITCHES.with_borrow(Clone::clone)
    }

    /// The last value written to `rsp0`.
    #[must_use]
    pub fn rsp0() -> u64 {
        RSP0.with(Cell::get)
    }

    /// The simulated FPU register file.
    #[must_use]
    pub fn live_fpu() -> FpuState {
        LIVE_FPU.with_borrow(|f| *f)
    }

    pub fn set_live_fpu(state: FpuState) {
        LIVE_FPU.with_borrow_mut(|f| *f = state);
    }

    /// Forgets all recorded state, including [`SimMmu`]'s.
    pub fn reset() {
        SWITCHES.with_borrow_mut(Vec::clear);
        RSP0.with(|r| r.set(0));
        LIVE_FPU.with_borrow_mut(|f| *f = FpuState::new());
        SimMmu::reset();
        SimInterrupts::enable();
    }
}

impl InterruptControl for SimArch {
    fn are_enabled() -> bool {
        SimInterrupts::are_enabled()
    }

    fn disable() {
        SimInterrupts::disable();
    }

    fn enable() {
        SimInterrupts::enable();
    }
}

impl Mmu for SimArch {
    fn invalidate_page(va: VirtualAddress) {
        SimMmu::invalidate_page(va);
    }

    fn flush_all() {
        SimMmu::flush_all();
    }

    unsafe fn load_root(root: PhysicalFrame) {
        unsafe { SimMmu::load_root(root) }
    }

    fn current_root() -> PhysicalFrame {
        SimMmu::current_root()
    }
}

impl Arch for SimArch {
    unsafe fn switch_context(_prev_sp: *mut u64, next_sp: u64, next_root: Option<PhysicalFrame>) {
        assert!(!Self::are_enabled(), "context switch with interrupts enabled");
        if let Some(root) = next_root {
            // SAFETY: simulated.
            unsafe { Self::load_root(root) };
        }
        SWITCHES.with_borrow_mut(|s| s.push(next_sp));
    }

    fn set_kernel_stack(top: VirtualAddress) {
        RSP0.with(|r| r.set(top.as_u64()));
    }

    unsafe fn save_fpu(area: &mut FpuState) {
        *area = Self::live_fpu();
    }

    unsafe fn restore_fpu(area: &FpuState) {
        Self::set_live_fpu(*area);
    }

    fn idle() {
        panic!("idle with no runnable process");
    }

    fn trap_return_entry() -> u64 {
        Self::TRAP_RETURN
    }
}
