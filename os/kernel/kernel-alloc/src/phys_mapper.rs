//! # Physical Memory Access
//!
//! Code can only dereference virtual addresses. [`PhysMapper`] turns a
//! physical address into a usable kernel pointer; page tables, kernel stacks
//! and copy-on-write copies are all reached through it, so nothing outside
//! this seam does physical-to-virtual arithmetic.
//!
//! In the kernel the mapping is the higher-half direct map
//! ([`HhdmPhysMapper`]): every physical address `pa` is visible at
//! `offset + pa`. Host tests back "physical RAM" with a heap buffer
//! (`sim::SimPhys`).

use kernel_info::memory::DEFAULT_HHDM_BASE;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Translate physical addresses into dereferenceable kernel addresses.
pub trait PhysMapper {
    /// Kernel-virtual alias of `pa`.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Borrow the `T` stored at `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped by this mapper, suitably aligned for `T`, and
    ///   hold a valid `T`.
    /// - The caller picks the lifetime and must not create aliasing `&mut`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.phys_to_virt(pa).as_mut_ptr::<T>();
        // SAFETY: forwarded to the caller.
        unsafe { &mut *ptr }
    }

    /// Borrow a whole frame as bytes.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn frame_bytes<'a>(&self, frame: PhysicalFrame) -> &'a mut [u8; FRAME_SIZE] {
        unsafe { self.phys_to_mut(frame.base()) }
    }

    /// Fills a frame with zeroes.
    #[inline]
    fn zero_frame(&self, frame: PhysicalFrame) {
        let ptr = self.phys_to_virt(frame.base()).as_mut_ptr::<u8>();
        // SAFETY: frames handed to the mapper are whole, mapped 4 KiB units.
        unsafe { core::ptr::write_bytes(ptr, 0, FRAME_SIZE) }
    }

    /// Copies all bytes of `src` into `dst`. The frames must differ.
    #[inline]
    fn copy_frame(&self, src: PhysicalFrame, dst: PhysicalFrame) {
        debug_assert_ne!(src, dst);
        let s = self.phys_to_virt(src.base()).as_mut_ptr::<u8>();
        let d = self.phys_to_virt(dst.base()).as_mut_ptr::<u8>();
        // SAFETY: two distinct mapped frames never overlap.
        unsafe { core::ptr::copy_nonoverlapping(s, d, FRAME_SIZE) }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}

/// [`PhysMapper`] for a higher-half direct map at a fixed offset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// Direct map at `offset`, as reported by the boot hand-off.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The reverse translation, for addresses inside the direct map.
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match va.as_u64().checked_sub(self.offset) {
            Some(pa) => Some(PhysicalAddress::new(pa)),
            None => None,
        }
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(DEFAULT_HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset + pa.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhdm_is_a_fixed_offset() {
        let m = HhdmPhysMapper::new(0xffff_8000_0000_0000);
        let va = m.phys_to_virt(PhysicalAddress::new(0x1234_5000));
        assert_eq!(va.as_u64(), 0xffff_8000_1234_5000);
        assert_eq!(m.virt_to_phys(va), Some(PhysicalAddress::new(0x1234_5000)));
        assert_eq!(m.virt_to_phys(VirtualAddress::new(0x1000)), None);
    }
}
