//! # Boot Hand-off

use crate::memory::DEFAULT_HHDM_BASE;

/// What a physical memory range is used for, as reported by the firmware.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM the frame allocator may hand out.
    Usable = 0,
    /// Firmware or hardware owned; never touched.
    Reserved = 1,
    /// ACPI tables, reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Loader structures, reclaimable after boot.
    BootloaderReclaimable = 5,
    /// The kernel image and loaded modules.
    KernelAndModules = 6,
    /// The linear framebuffer.
    Framebuffer = 7,
}

impl MemoryKind {
    /// Whether frames of this kind count towards addressable RAM when sizing
    /// the allocator's bitmap. Reserved ranges and bad memory do not.
    #[must_use]
    pub const fn is_addressable_ram(self) -> bool {
        !matches!(self, Self::Reserved | Self::BadMemory)
    }
}

/// One entry of the physical memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryKind::Usable)
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Information the kernel core needs from the loader.
#[derive(Debug, Copy, Clone)]
pub struct BootHandoff<'a> {
    /// Physical memory map.
    pub memory_map: &'a [MemoryRegion],

    /// Offset at which all physical RAM is mapped into the kernel half.
    pub hhdm_offset: u64,
}

impl<'a> BootHandoff<'a> {
    #[must_use]
    pub const fn new(memory_map: &'a [MemoryRegion]) -> Self {
        Self {
            memory_map,
            hhdm_offset: DEFAULT_HHDM_BASE,
        }
    }

    #[must_use]
    pub const fn with_hhdm_offset(mut self, offset: u64) -> Self {
        self.hhdm_offset = offset;
        self
    }

    /// Total bytes reported as [`MemoryKind::Usable`].
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .map(|r| r.length)
            .sum()
    }
}
