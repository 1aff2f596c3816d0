//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: per-process address spaces,
//! copy-on-write cloning, the MMIO/DMA window and the per-process registry
//! of mapped areas.
//!
//! ## What you get
//! - [`AddressSpace`]: a handle to one PML4-rooted tree with map, unmap,
//!   translate, protect, clone and free.
//! - [`PageEntryBits`]: the raw entry bitfield shared by all levels.
//! - [`cow::resolve_write_fault`]: the copy-on-write half of page-fault
//!   handling.
//! - [`MmioWindow`]: uncached device and DMA mappings in the kernel half.
//! - [`VmaList`]: which user ranges a process has mapped, and how.
//! - [`Mmu`]: the seam to `CR3` and the TLB.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry) → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! ## Address space layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┬ user half: private per process, CoW after fork
//! 0x0000_7fff_ffff_ffff ┴
//! 0xffff_8000_0000_0000 ┬ kernel half: PML4 slots shared by reference
//!   HHDM                │   all physical RAM
//!   kernel stack slot   │   private per space (slot 510)
//!   kernel image        │
//!   MMIO window         │   uncached device / DMA mappings
//! 0xffff_ffff_ffff_ffff ┴
//! ```
//!
//! This crate only builds 4 KiB leaves. Larger leaves made by the loader
//! are followed by [`AddressSpace::translate`] and split on demand in the
//! kernel half.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod cow;
pub mod mmio;
pub mod mmu;
mod page_entry_bits;
pub mod page_table;
pub mod vma;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, RootPage};
pub use crate::cow::{FaultOutcome, resolve_write_fault};
pub use crate::mmio::{DmaAllocation, MmioWindow, remap_write_combining};
pub use crate::mmu::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::X86Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::PageTable;
pub use crate::vma::{Vma, VmaError, VmaKind, VmaList};

use kernel_alloc::FrameAllocError;
use kernel_memory_addresses::VirtualAddress;

/// Errors from address-space operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is covered by a huge page")]
    HugePage(VirtualAddress),
    #[error("size must be at least one byte")]
    InvalidSize,
    #[error("MMIO window exhausted")]
    WindowExhausted,
}

impl From<FrameAllocError> for VmemError {
    fn from(_: FrameAllocError) -> Self {
        Self::OutOfMemory
    }
}
