//! # MMIO and DMA Window
//!
//! Device registers and DMA buffers are mapped into a dedicated range of the
//! kernel half. Space is handed out page-granular from a cursor that only
//! ever moves up; unmapped ranges are not reused.

use crate::{AddressSpace, Mmu, PageEntryBits, VmemError};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::memory::{MMIO_WINDOW_BASE, MMIO_WINDOW_END};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, Size4K, VirtualAddress};

const PAGE: u64 = FRAME_SIZE as u64;

/// A DMA buffer: physically contiguous, mapped uncached in the window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaAllocation {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub size: u64,
}

impl DmaAllocation {
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.size / PAGE
    }
}

/// Bump allocator over kernel-virtual window space.
#[derive(Debug)]
pub struct MmioWindow {
    next: u64,
    end: u64,
    dma_bytes: u64,
}

impl Default for MmioWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioWindow {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_range(MMIO_WINDOW_BASE, MMIO_WINDOW_END)
    }

    #[must_use]
    pub const fn with_range(base: u64, end: u64) -> Self {
        Self {
            next: base,
            end,
            dma_bytes: 0,
        }
    }

    /// Bytes of DMA buffers currently handed out.
    #[must_use]
    pub const fn dma_in_use(&self) -> u64 {
        self.dma_bytes
    }

    /// Window space not yet handed out.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }

    fn reserve(&mut self, pages: u64) -> Result<VirtualAddress, VmemError> {
        let bytes = pages.checked_mul(PAGE).ok_or(VmemError::WindowExhausted)?;
        if bytes > self.remaining() {
            log::warn!("MMIO window exhausted ({pages} pages requested)");
            return Err(VmemError::WindowExhausted);
        }
        let va = VirtualAddress::new(self.next);
        self.next += bytes;
        Ok(va)
    }

    /// Map `size` bytes of device memory at `phys` uncached.
    ///
    /// Returns the virtual address of `phys` itself, in-page offset included.
    ///
    /// # Errors
    /// - [`VmemError::InvalidSize`] for `size == 0` or a range past the end
    ///   of the physical address space.
    /// - [`VmemError::WindowExhausted`] if the window is used up.
    /// - [`VmemError::OutOfMemory`] if page tables cannot be allocated.
    ///   Pages mapped so far are unmapped again.
    pub fn map_mmio<M: PhysMapper, U: Mmu, A: FrameAlloc>(
        &mut self,
        space: &AddressSpace<'_, M, U>,
        alloc: &mut A,
        phys: PhysicalAddress,
        size: u64,
    ) -> Result<VirtualAddress, VmemError> {
        if size == 0 {
            return Err(VmemError::InvalidSize);
        }
        let end = phys
            .as_u64()
            .checked_add(size)
            .filter(|end| *end <= u64::MAX - PAGE)
            .ok_or(VmemError::InvalidSize)?;
        let first = phys.align_down::<Size4K>();
        let last = PhysicalAddress::new(end).align_up::<Size4K>();
        let pages = (last - first) / PAGE;

        let va = self.reserve(pages)?;
        for n in 0..pages {
            let frame = PhysicalFrame::containing(first + n * PAGE);
            if let Err(e) = space.map_page(alloc, va + n * PAGE, frame, PageEntryBits::mmio()) {
                for m in 0..n {
                    let _ = space.unmap_page(va + m * PAGE);
                }
                return Err(e);
            }
        }
        log::debug!("mmio {phys} (+{size:#x}) at {va}");
        Ok(va + phys.offset::<Size4K>())
    }

    /// Allocate `pages` contiguous frames and map them uncached.
    ///
    /// The buffer is zeroed.
    ///
    /// # Errors
    /// [`VmemError::InvalidSize`] for zero pages, otherwise as
    /// [`map_mmio`](Self::map_mmio). Nothing stays allocated on failure.
    pub fn alloc_dma<M: PhysMapper, U: Mmu, A: FrameAlloc>(
        &mut self,
        space: &AddressSpace<'_, M, U>,
        alloc: &mut A,
        pages: usize,
    ) -> Result<DmaAllocation, VmemError> {
        if pages == 0 {
            return Err(VmemError::InvalidSize);
        }
        let first = alloc.alloc_frames(pages)?;
        let count = pages as u64;
        for n in 0..count {
            space.mapper().zero_frame(first.add(n));
        }

        let va = match self.reserve(count) {
            Ok(va) => va,
            Err(e) => {
                alloc.free_frames(first, pages);
                return Err(e);
            }
        };
        for n in 0..count {
            let mapped = space.map_page(alloc, va + n * PAGE, first.add(n), PageEntryBits::mmio());
            if let Err(e) = mapped {
                for m in 0..n {
                    let _ = space.unmap_page(va + m * PAGE);
                }
                alloc.free_frames(first, pages);
                return Err(e);
            }
        }

        let dma = DmaAllocation {
            virt: va,
            phys: first.base(),
            size: count * PAGE,
        };
        self.dma_bytes += dma.size;
        log::debug!("dma {pages} pages at {} / {}", dma.virt, dma.phys);
        Ok(dma)
    }

    /// Unmap a DMA buffer and return its frames.
    ///
    /// The window range itself is not reused.
    pub fn free_dma<M: PhysMapper, U: Mmu, A: FrameAlloc>(
        &mut self,
        space: &AddressSpace<'_, M, U>,
        alloc: &mut A,
        dma: DmaAllocation,
    ) {
        for n in 0..dma.pages() {
            if space.unmap_page(dma.virt + n * PAGE).is_err() {
                log::warn!("dma page {} already unmapped", dma.virt + n * PAGE);
            }
        }
        let pages = usize::try_from(dma.pages()).unwrap_or(0);
        alloc.free_frames(PhysicalFrame::containing(dma.phys), pages);
        self.dma_bytes = self.dma_bytes.saturating_sub(dma.size);
        log::debug!("freed dma at {}", dma.virt);
    }
}

/// Switch an existing kernel mapping (a framebuffer, typically) to
/// write-combining.
///
/// # Errors
/// [`VmemError::NotMapped`] at the first page without a 4 KiB mapping.
pub fn remap_write_combining<M: PhysMapper, U: Mmu>(
    space: &AddressSpace<'_, M, U>,
    va: VirtualAddress,
    size: u64,
) -> Result<(), VmemError> {
    let start = va.align_down::<Size4K>();
    let end = (va + size).align_up::<Size4K>();
    let mut page = start;
    while page.as_u64() < end.as_u64() {
        let entry = space.leaf_entry(page).ok_or(VmemError::NotMapped(page))?;
        space.protect(page, entry.flags().with_write_combining())?;
        page += PAGE;
    }
    Ok(())
}
