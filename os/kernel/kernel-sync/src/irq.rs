//! Interrupt-enable control.
//!
//! Everything that needs to mask interrupts goes through [`InterruptControl`]
//! so the lock types can run on the host under a simulated `IF` flag. The
//! x86-64 implementation is [`X86Interrupts`].

use core::marker::PhantomData;

/// Access to the CPU's interrupt-enable flag.
///
/// Implementors are zero-sized markers; all operations are associated
/// functions so that lock types can be generic without storing anything.
pub trait InterruptControl {
    /// Whether maskable interrupts are currently enabled.
    fn are_enabled() -> bool;

    /// Masks interrupts.
    fn disable();

    /// Unmasks interrupts.
    fn enable();

    /// Masks interrupts and reports whether they were enabled before.
    #[inline]
    #[must_use]
    fn save_and_disable() -> bool {
        let enabled = Self::are_enabled();
        if enabled {
            Self::disable();
        }
        enabled
    }

    /// Re-enables interrupts only if `were_enabled` is set.
    #[inline]
    fn restore(were_enabled: bool) {
        if were_enabled {
            Self::enable();
        }
    }
}

/// RAII guard that disables interrupts on creation and restores the prior
/// state on drop.
///
/// Dropping never enables interrupts that were off when the guard was made,
/// so guards nest.
///
/// ```rust,ignore
/// # use kernel_sync::{InterruptControl, IrqGuard};
/// # use kernel_sync::sim::SimInterrupts;
/// SimInterrupts::enable();
/// {
///     let _outer = IrqGuard::<SimInterrupts>::new();
///     {
///         let _inner = IrqGuard::<SimInterrupts>::new();
///     }
///     assert!(!SimInterrupts::are_enabled());
/// }
/// assert!(SimInterrupts::are_enabled());
/// ```
#[must_use = "interrupts are restored when the guard is dropped"]
pub struct IrqGuard<I: InterruptControl> {
    were_enabled: bool,
    _irq: PhantomData<I>,
}

impl<I: InterruptControl> IrqGuard<I> {
    #[inline]
    pub fn new() -> Self {
        Self {
            were_enabled: I::save_and_disable(),
            _irq: PhantomData,
        }
    }

    /// Whether interrupts were enabled when this guard was created.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl<I: InterruptControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.were_enabled);
    }
}

/// `cli`/`sti` on the running CPU.
///
/// # Privilege
///
/// Only valid at CPL0; executing `cli` in user mode faults.
#[cfg(target_arch = "x86_64")]
pub struct X86Interrupts;

#[cfg(target_arch = "x86_64")]
impl X86Interrupts {
    /// Interrupt-enable flag (bit 9 of `RFLAGS`).
    const IF: u64 = 1 << 9;

    /// Returns the current `RFLAGS` value.
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

#[cfg(target_arch = "x86_64")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn are_enabled() -> bool {
        Self::rflags() & Self::IF != 0
    }

    #[inline]
    fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}
