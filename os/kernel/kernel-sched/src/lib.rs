//! # Processes and Scheduling
//!
//! Single-core, round-robin scheduling of kernel tasks and user processes,
//! with Unix-style process lifecycle: `fork`, `exit`, `waitpid`, `sleep`.
//!
//! ## Pieces
//! - [`Scheduler`]: owns the [`ProcessTable`] behind an interrupt-safe lock
//!   and implements every lifecycle operation. Also the
//!   [`Parker`](kernel_sync::Parker) that
//!   lets a [`SleepMutex`](kernel_sync::SleepMutex) block processes.
//! - [`Process`]: the control block. Saved stack pointer, FPU area, kernel
//!   stack, optional private address space, files and mapped areas.
//! - [`Arch`]: the CPU-specific half. [`X86_64`] on hardware,
//!   `sim::SimArch` (feature `sim`) on the host.
//!
//! ## Switching
//!
//! ```text
//!  schedule()
//!    ├─ lock table, pick next Ready after current (wrapping)
//!    ├─ check outgoing stack guard
//!    ├─ save outgoing FPU, restore incoming FPU
//!    ├─ rsp0 := incoming kernel stack top
//!    ├─ unlock table
//!    └─ Arch::switch_context(…, incoming root if different)
//! ```
//!
//! The table lock is never held across the switch itself; interrupts stay
//! masked from the pick until the switched-to context restores its own
//! interrupt state.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arch;
pub mod context;
mod pid;
pub mod process;
mod scheduler;
pub mod stack;
pub mod table;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::arch::Arch;
#[cfg(target_arch = "x86_64")]
pub use crate::arch::X86_64;
pub use crate::context::{FpuState, SwitchFrame, TrapFrame};
pub use crate::pid::{Pid, WaitTarget};
pub use crate::process::{FileHandle, FileTable, Process, ProcessInfo, ProcessName, ProcessState};
pub use crate::scheduler::{Scheduler, WaitStep};
pub use crate::stack::KernelStack;
pub use crate::table::ProcessTable;

use kernel_alloc::FrameAllocError;
use kernel_vmem::VmemError;

/// Why `fork` failed. Nothing of the child remains in any case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    #[error("kernel tasks have no address space to fork")]
    KernelTask,
    #[error("out of memory")]
    OutOfMemory,
    #[error("process table full")]
    ProcessTableFull,
}

impl From<VmemError> for ForkError {
    fn from(_: VmemError) -> Self {
        Self::OutOfMemory
    }
}

impl From<FrameAllocError> for ForkError {
    fn from(_: FrameAllocError) -> Self {
        Self::OutOfMemory
    }
}

/// Why a new process could not be started.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("process table full")]
    ProcessTableFull,
}

impl From<VmemError> for SpawnError {
    fn from(_: VmemError) -> Self {
        Self::OutOfMemory
    }
}

impl From<FrameAllocError> for SpawnError {
    fn from(_: FrameAllocError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no child matches")]
    NoChildren,
}
