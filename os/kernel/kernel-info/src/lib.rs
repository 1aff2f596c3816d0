//! # Kernel Configuration and Boot Interface
//!
//! The single source of truth for values that several kernel crates must
//! agree on:
//!
//! * [`boot`]: what the firmware hand-off delivers (physical memory map and
//!   the direct-map offset). Consumed once at initialization, never updated.
//! * [`memory`]: the fixed virtual layout, most importantly the per-process
//!   kernel-stack window and the MMIO window.
//! * [`sched`]: scheduler tunables (stack sentinel, table limits, timer rate).
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   User space (private per       │
//!                       │   process, CoW-shared on fork)  │
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! DEFAULT_HHDM_BASE     ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Direct map of physical RAM    │
//! KERNEL_STACK_BASE     ├─────────────────────────────────┤ 0xffff_ff7f_ffff_c000
//!                       │   Per-process kernel stack      │
//! KERNEL_STACK_TOP      ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel image                  │
//! MMIO_WINDOW_BASE      ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │   MMIO / DMA window             │
//! MMIO_WINDOW_END       └─────────────────────────────────┘ 0xffff_ffff_f000_0000
//! ```
//!
//! Every top-level (PML4) slot of the upper half is shared by reference
//! between all address spaces, except [`memory::KERNEL_STACK_SLOT`], which
//! each address space owns privately so the kernel stack of every process
//! sits at the same virtual address.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod sched;
