use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, Size1G, Size2M};

/// A single 64-bit x86-64 page-table entry in raw bitfield form.
///
/// The layout is the common superset of all four levels (PML4E, PDPTE, PDE,
/// PTE). Whether bit 7 means "large page" or "PAT" depends on the level the
/// entry lives in: at L3/L2 it makes the entry a 1 GiB / 2 MiB leaf, in a
/// 4 KiB PTE it selects PAT entry 4, which the kernel programs as
/// write-combining.
///
/// | Bits  | Name   | Meaning                                    |
/// |-------|--------|--------------------------------------------|
/// | 0     | P      | Present                                    |
/// | 1     | RW     | Writable                                   |
/// | 2     | US     | User accessible                            |
/// | 3     | PWT    | Write-through                              |
/// | 4     | PCD    | Cache disable                              |
/// | 5     | A      | Accessed                                   |
/// | 6     | D      | Dirty (leaf only)                          |
/// | 7     | PS/PAT | Large page (L3/L2) or PAT (L1)             |
/// | 8     | G      | Global (leaf only)                         |
/// | 9–11  | avail  | OS use                                     |
/// | 12–51 | addr   | Physical frame bits [51:12]                |
/// | 52–58 | avail  | OS use                                     |
/// | 59–62 | PKU    | Protection key                             |
/// | 63    | NX     | Execute disable                            |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalFrame;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::user_rw().with_frame(PhysicalFrame::from_number(0x12));
/// assert!(e.present() && e.user_access());
/// assert_eq!(e.frame().number(), 0x12);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Permissions are the intersection over the walk.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size at L3/L2; PAT selector in a 4 KiB PTE.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    #[bits(7)]
    pub os_available_high: u8,

    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Mask of every bit that is not part of the physical address.
    const FLAG_MASK: u64 = !(((1 << 40) - 1) << 12);

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The 4 KiB frame an entry points at (a table, or a 4 KiB leaf).
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::containing(self.physical_address())
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, frame: PhysicalFrame) -> Self {
        self.set_physical_address(frame.base());
        self
    }

    /// Base of a 2 MiB leaf. Bit 12 of such an entry is PAT, not address.
    #[inline]
    #[must_use]
    pub const fn huge_2m_base(&self) -> PhysicalAddress {
        self.physical_address().align_down::<Size2M>()
    }

    /// Base of a 1 GiB leaf.
    #[inline]
    #[must_use]
    pub const fn huge_1g_base(&self) -> PhysicalAddress {
        self.physical_address().align_down::<Size1G>()
    }

    /// The entry with its address bits cleared.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> Self {
        Self::from_bits(self.into_bits() & Self::FLAG_MASK)
    }

    /// Same address, flags replaced by those of `flags`.
    #[inline]
    #[must_use]
    pub const fn with_flags_of(self, flags: Self) -> Self {
        Self::from_bits(
            (self.into_bits() & !Self::FLAG_MASK) | (flags.into_bits() & Self::FLAG_MASK),
        )
    }

    /// Intermediate (non-leaf) entry. `user` entries allow the walk to
    /// continue for CPL 3; the leaf still decides.
    #[inline]
    #[must_use]
    pub const fn table(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
    }

    /// Kernel data: read/write, not executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
    }

    /// Kernel code.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true)
    }

    /// User data and stacks.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// User code.
    #[inline]
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// Device registers: uncached (PCD|PWT), never executable.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    /// Marks a 4 KiB leaf write-combining through PAT entry 4.
    #[inline]
    #[must_use]
    pub const fn with_write_combining(self) -> Self {
        self.with_cache_disabled(false)
            .with_write_through(false)
            .with_large_page(true)
    }
}
