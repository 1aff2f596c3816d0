//! # Translation Hardware
//!
//! The page-table code never touches `CR3` or the TLB directly; it goes
//! through [`Mmu`]. The kernel uses [`X86Mmu`], host tests `sim::SimMmu`.

use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// Control over the active translation root and the TLB.
pub trait Mmu {
    /// Drop any cached translation of the page containing `va`.
    fn invalidate_page(va: VirtualAddress);

    /// Drop every non-global cached translation.
    fn flush_all();

    /// Make `root` the active top-level table.
    ///
    /// # Safety
    /// `root` must be a complete address space that maps the currently
    /// executing code and stack.
    unsafe fn load_root(root: PhysicalFrame);

    /// Top-level table currently in use.
    fn current_root() -> PhysicalFrame;
}

#[cfg(target_arch = "x86_64")]
pub use x86::{Cr3, X86Mmu};

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::Mmu;
    use bitfield_struct::bitfield;
    use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

    /// CR3 with PCID disabled: PML4 base plus the cache controls for the walk.
    #[bitfield(u64)]
    pub struct Cr3 {
        #[bits(3)]
        __: u8,
        pub pwt: bool,
        pub pcd: bool,
        #[bits(7)]
        __: u8,
        #[bits(40)]
        pml4_base_4k: u64,
        #[bits(12)]
        __: u16,
    }

    impl Cr3 {
        #[must_use]
        pub const fn from_root(root: PhysicalFrame) -> Self {
            Self::new().with_pml4_base_4k(root.number())
        }

        #[must_use]
        pub const fn root(&self) -> PhysicalFrame {
            PhysicalFrame::containing(PhysicalAddress::new(self.pml4_base_4k() << 12))
        }
    }

    /// The real thing.
    pub struct X86Mmu;

    impl Mmu for X86Mmu {
        #[inline]
        fn invalidate_page(va: VirtualAddress) {
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
            }
        }

        #[inline]
        fn flush_all() {
            // Reloading CR3 with itself drops all non-global entries.
            unsafe {
                core::arch::asm!(
                    "mov {tmp}, cr3",
                    "mov cr3, {tmp}",
                    tmp = out(reg) _,
                    options(nostack, preserves_flags)
                );
            }
        }

        #[inline]
        unsafe fn load_root(root: PhysicalFrame) {
            let cr3 = Cr3::from_root(root).into_bits();
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
            }
        }

        #[inline]
        fn current_root() -> PhysicalFrame {
            let cr3: u64;
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            Cr3::from_bits(cr3).root()
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn cr3_keeps_only_the_base() {
        let root = PhysicalFrame::from_number(0x1234);
        let cr3 = Cr3::from_root(root).with_pcd(true);
        assert_eq!(cr3.into_bits(), 0x0123_4000 | (1 << 4));
        assert_eq!(cr3.root(), root);
    }
}
