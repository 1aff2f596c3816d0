//! # Physical and Virtual Address Types
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at the
//! type level, plus page-aligned page/frame bases for each supported page
//! size.
//!
//! | Type                     | Meaning                                        |
//! |--------------------------|------------------------------------------------|
//! | [`PhysicalAddress`]      | A byte address in physical memory or MMIO.     |
//! | [`VirtualAddress`]       | A byte address translated by the page tables.  |
//! | [`PhysicalPage<S>`]      | Page-aligned physical base of an `S` page.     |
//! | [`VirtualPage<S>`]       | Page-aligned virtual base of an `S` page.      |
//! | [`PhysicalFrame`]        | Shorthand for `PhysicalPage<Size4K>`.          |
//!
//! The allocator and the page-table code trade exclusively in 4 KiB frames;
//! [`Size2M`] and [`Size1G`] only appear when walking large leaves that the
//! boot environment installed in the kernel half.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_FFFF_E123);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_7FFF_FFFF_E000);
//! assert_eq!(va.offset::<Size4K>(), 0x123);
//! assert!(va.is_user());
//!
//! let frame = PhysicalFrame::from_number(3);
//! assert_eq!(frame.base().as_u64(), 0x3000);
//! assert_eq!(frame.number(), 3);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page;
mod physical_address;
mod virtual_address;

use core::fmt;
use core::hash::Hash;

pub use page::{PhysicalFrame, PhysicalPage, VirtualPage};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes supported by 4-level paging.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
    /// Page size in bytes (power of two).
    const SIZE: u64;

    /// `log2(SIZE)`.
    const SHIFT: u32;

    /// Mask of the in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
}

/// 4 KiB page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// 2 MiB page (a PD-level leaf).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

/// 1 GiB page (a PDPT-level leaf).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;

impl sealed::Sealed for Size4K {}
impl sealed::Sealed for Size2M {}
impl sealed::Sealed for Size1G {}

impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
}

impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
}

impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;
}

/// Bytes in one 4 KiB frame, as `usize` for buffer sizing.
pub const FRAME_SIZE: usize = 4096;

/// Number of 4 KiB pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(Size4K::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
    }

    #[test]
    fn masks_match_sizes() {
        assert_eq!(Size4K::MASK, 0xFFF);
        assert_eq!(Size2M::MASK, 0x1F_FFFF);
        assert_eq!(Size1G::MASK, 0x3FFF_FFFF);
    }
}
