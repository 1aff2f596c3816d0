//! # Architecture Seam
//!
//! Everything the scheduler needs from the CPU beyond interrupt masking
//! ([`InterruptControl`]) and the translation root ([`Mmu`]):
//!
//! * the context switch itself,
//! * the `rsp0` slot of the TSS,
//! * FPU/SIMD state save and restore,
//! * halting until the next interrupt,
//! * the address of the trampoline that leaves a fresh stack for user mode.
//!
//! [`X86_64`] is the real implementation; `sim::SimArch` (feature `sim`)
//! records calls instead of executing them.

use crate::context::FpuState;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_sync::InterruptControl;
use kernel_vmem::Mmu;

/// CPU services used by the scheduler.
pub trait Arch: InterruptControl + Mmu {
    /// Saves the callee-saved registers and flags on the current stack,
    /// stores the stack pointer to `*prev_sp`, loads `next_root` if given,
    /// then resumes the context saved at `next_sp`.
    ///
    /// Returns when some later switch resumes the saved context.
    ///
    /// # Safety
    /// - Interrupts must be disabled.
    /// - `prev_sp` must stay valid until the switch has happened.
    /// - `next_sp` must be a stack pointer saved by this function or seeded
    ///   with a [`SwitchFrame`](crate::context::SwitchFrame), valid in
    ///   `next_root` (or the current root if `None`).
    unsafe fn switch_context(prev_sp: *mut u64, next_sp: u64, next_root: Option<PhysicalFrame>);

    /// Stack used on the next privilege change to ring 0.
    fn set_kernel_stack(top: VirtualAddress);

    /// Stores the live FPU/SIMD registers.
    ///
    /// # Safety
    /// Interrupts must be disabled so the state cannot change underneath.
    unsafe fn save_fpu(area: &mut FpuState);

    /// Loads FPU/SIMD registers.
    ///
    /// # Safety
    /// `area` must hold an image produced by [`save_fpu`](Self::save_fpu) or
    /// [`FpuState::new`].
    unsafe fn restore_fpu(area: &FpuState);

    /// Enables interrupts, waits for one and returns with interrupts
    /// disabled again.
    fn idle();

    /// Where a stack seeded for user entry resumes: pops a
    /// [`TrapFrame`](crate::context::TrapFrame) and returns through `iretq`.
    fn trap_return_entry() -> u64;
}

#[cfg(target_arch = "x86_64")]
pub use x86::X86_64;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::Arch;
    use crate::context::FpuState;
    use core::arch::naked_asm;
    use core::ptr::null_mut;
    use core::sync::atomic::{AtomicPtr, Ordering};
    use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
    use kernel_sync::{InterruptControl, X86Interrupts};
    use kernel_vmem::mmu::Cr3;
    use kernel_vmem::{Mmu, X86Mmu};

    /// The `rsp0` field of the loaded TSS.
    static RSP0_SLOT: AtomicPtr<u64> = AtomicPtr::new(null_mut());

    /// The running x86-64 CPU.
    pub struct X86_64;

    impl X86_64 {
        /// Registers where [`Arch::set_kernel_stack`] writes.
        ///
        /// # Safety
        /// `slot` must point at the `rsp0` field of the TSS in the task
        /// register and stay valid for the kernel's lifetime. The field may be
        /// unaligned; the TSS is packed.
        pub unsafe fn register_rsp0_slot(slot: *mut u64) {
            RSP0_SLOT.store(slot, Ordering::Release);
        }
    }

    impl InterruptControl for X86_64 {
        #[inline]
        fn are_enabled() -> bool {
            X86Interrupts::are_enabled()
        }

        #[inline]
        fn disable() {
            X86Interrupts::disable();
        }

        #[inline]
        fn enable() {
            X86Interrupts::enable();
        }
    }

    impl Mmu for X86_64 {
        #[inline]
        fn invalidate_page(va: VirtualAddress) {
            X86Mmu::invalidate_page(va);
        }

        #[inline]
        fn flush_all() {
            X86Mmu::flush_all();
        }

        #[inline]
        unsafe fn load_root(root: PhysicalFrame) {
            unsafe { X86Mmu::load_root(root) }
        }

        #[inline]
        fn current_root() -> PhysicalFrame {
            X86Mmu::current_root()
        }
    }

    impl Arch for X86_64 {
        #[inline]
        unsafe fn switch_context(prev_sp: *mut u64, next_sp: u64, next_root: Option<PhysicalFrame>) {
            let cr3 = next_root.map_or(0, |root| Cr3::from_root(root).into_bits());
            unsafe { switch_stacks(prev_sp, next_sp, cr3) }
        }

        fn set_kernel_stack(top: VirtualAddress) {
            let slot = RSP0_SLOT.load(Ordering::Acquire);
            if slot.is_null() {
                log::warn!("rsp0 slot not registered; kernel stack {top} not installed");
                return;
            }
            // SAFETY: see `register_rsp0_slot`.
            unsafe { slot.write_unaligned(top.as_u64()) }
        }

        #[inline]
        unsafe fn save_fpu(area: &mut FpuState) {
            unsafe {
                core::arch::asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr(), options(nostack, preserves_flags));
            }
        }

        #[inline]
        unsafe fn restore_fpu(area: &FpuState) {
            unsafe {
                core::arch::asm!("fxrstor64 [{}]", in(reg) area.0.as_ptr(), options(nostack, preserves_flags, readonly));
            }
        }

        #[inline]
        fn idle() {
            // `sti` takes effect after the next instruction, so no interrupt
            // can slip in between it and `hlt`.
            unsafe { core::arch::asm!("sti", "hlt", "cli", options(nomem, nostack)) }
        }

        fn trap_return_entry() -> u64 {
            trap_return as usize as u64
        }
    }

    /// Context switch.
    ///
    /// `rdi` = where to store the outgoing stack pointer, `rsi` = incoming
    /// stack pointer, `rdx` = new `CR3` or zero to keep the current one.
    ///
    /// Pushes, in this order (so the lowest address holds `r15`):
    ///   `rflags`, `rbx`, `rbp`, `r12`, `r13`, `r14`, `r15`
    /// on top of the return address pushed by the `call`.
    ///
    /// `CR3` is written after the outgoing frame is complete and before the
    /// incoming stack is touched: both stacks may live at the same virtual
    /// address in different address spaces.
    #[unsafe(naked)]
    unsafe extern "C" fn switch_stacks(prev_sp: *mut u64, next_sp: u64, next_cr3: u64) {
        naked_asm!(
            "pushfq",
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "test rdx, rdx",
            "jz 2f",
            "mov cr3, rdx",
            "2:",
            "mov rsp, rsi",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            "popfq",
            "ret",
        )
    }

    /// First return to user mode of a seeded stack.
    ///
    /// Entered by the `ret` of [`switch_stacks`] with `rsp` at a
    /// [`TrapFrame`](crate::context::TrapFrame): restore every general
    /// purpose register, switch `GS` back if returning to ring 3, `iretq`.
    #[unsafe(naked)]
    extern "C" fn trap_return() {
        naked_asm!(
            "pop rax",
            "pop rbx",
            "pop rcx",
            "pop rdx",
            "pop rsi",
            "pop rdi",
            "pop rbp",
            "pop r8",
            "pop r9",
            "pop r10",
            "pop r11",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            // CS of the iret frame at [rsp + 8]
            "test qword ptr [rsp + 8], 3",
            "jz 2f",
            "swapgs",
            "2:",
            "iretq",
        )
    }
}
