//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: busy-waiting lock that masks interrupts while held and
//!   restores the caller's exact interrupt state on release.
//! * [`SleepMutex`]: blocking lock whose contenders sleep in the scheduler
//!   (through [`Parker`]) instead of spinning.
//! * [`SyncOnceCell`]: write-once slot for kernel singletons.
//! * [`IrqGuard`]: scoped interrupt masking.
//!
//! Interrupt masking is abstracted by [`InterruptControl`]; the kernel uses
//! [`X86Interrupts`], host tests use `sim::SimInterrupts` (feature `sim`).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod irq;
mod sleep_mutex;
mod spin_lock;
mod sync_once_cell;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(target_arch = "x86_64")]
pub use irq::X86Interrupts;
pub use irq::{InterruptControl, IrqGuard};
pub use sleep_mutex::{Parker, SleepMutex, SleepMutexGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
