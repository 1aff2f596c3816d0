//! # Kernel Core
//!
//! Wires the memory and process subsystems into one [`Kernel`] value and
//! exposes what the (external) interrupt and syscall entry stubs call into:
//!
//! * [`Kernel::handle_page_fault`]: copy-on-write resolution or a verdict,
//! * [`Kernel::syscall`] and the `sys_*` wrappers: the process ABI,
//! * [`Kernel::on_timer_tick`]: time keeping and preemption,
//! * MMIO and DMA mappings for drivers.
//!
//! ## Bring-up
//!
//! ```text
//! BootHandoff ──► BitmapFrameAlloc::bootstrap ──► SharedFrameAlloc (once cell)
//!                                                    │
//! current CR3 ─────────────► kernel root ────────────┼──► Scheduler (pid 0 = boot context)
//!                                                    └──► MMIO window
//! ```
//!
//! The kernel is generic over [`Arch`] and [`PhysMapper`]: on hardware
//! `Kernel<X86_64, HhdmPhysMapper>`, in tests the simulated counterparts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logging;
pub mod page_fault;
pub mod syscall;

pub use crate::logging::init_logging;
pub use crate::page_fault::{PageFaultDecision, PageFaultError};
pub use crate::syscall::Sysno;

use kernel_alloc::{BitmapFrameAlloc, FrameAllocError, PhysMapper, SharedFrameAlloc};
use kernel_info::boot::BootHandoff;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sched::{Arch, Scheduler};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{AddressSpace, DmaAllocation, MmioWindow, RootPage, VmemError};

/// Handle through which every subsystem reaches the frame allocator.
pub type Frames<'k, A> = &'k SharedFrameAlloc<'static, A>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("frame allocator: {0}")]
    FrameAlloc(#[from] FrameAllocError),
    #[error("the frame allocator was already initialized")]
    AlreadyInitialized,
}

/// The memory and process core of a running kernel.
pub struct Kernel<'k, A: Arch, M: PhysMapper> {
    frames: Frames<'k, A>,
    mapper: &'k M,
    sched: Scheduler<'k, A, M, Frames<'k, A>>,
    mmio: SpinLock<MmioWindow, A>,
}

impl<'k, A: Arch, M: PhysMapper> Kernel<'k, A, M> {
    /// Brings up the frame allocator from the boot memory map, adopts the
    /// active translation root as the kernel address space and starts the
    /// scheduler with the caller as pid 0.
    ///
    /// # Errors
    /// - [`KernelError::FrameAlloc`] if the memory map cannot hold the
    ///   allocator's own bookkeeping.
    /// - [`KernelError::AlreadyInitialized`] if `frames` is already set.
    ///
    /// # Safety
    /// `mapper` must map all usable RAM of `boot.memory_map`, none of which
    /// may be in use, and the active root must be the kernel's.
    pub unsafe fn new(
        boot: &BootHandoff<'_>,
        mapper: &'k M,
        frames: &'k SyncOnceCell<SharedFrameAlloc<'static, A>>,
    ) -> Result<Self, KernelError> {
        // SAFETY: forwarded to the caller.
        let alloc = unsafe { BitmapFrameAlloc::bootstrap(boot.memory_map, mapper) }?;
        let frames = frames
            .set(SharedFrameAlloc::new(alloc))
            .map_err(|_| KernelError::AlreadyInitialized)?;
        log::info!(
            "{} KiB of {} KiB physical memory free",
            frames.free_bytes() / 1024,
            frames.total_bytes() / 1024
        );

        let kernel_root = A::current_root();
        Ok(Self {
            frames,
            mapper,
            sched: Scheduler::new(mapper, frames, kernel_root),
            mmio: SpinLock::new(MmioWindow::new()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<'k, A, M, Frames<'k, A>> {
        &self.sched
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> Frames<'k, A> {
        self.frames
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'k M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.sched.kernel_root()
    }

    #[must_use]
    pub fn kernel_space(&self) -> AddressSpace<'k, M, A> {
        AddressSpace::from_root(self.mapper, self.kernel_root())
    }

    /// An empty user address space sharing the kernel half, to be filled
    /// and handed to [`Scheduler::spawn_user`].
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`].
    pub fn create_user_space(&self) -> Result<AddressSpace<'k, M, A>, VmemError> {
        let mut frames = self.frames;
        AddressSpace::create(self.mapper, &mut frames, self.kernel_root())
    }

    /// Timer interrupt entry.
    pub fn on_timer_tick(&self) {
        self.sched.on_timer_tick();
    }

    /// Maps `size` bytes of device registers at `phys` uncached into the
    /// kernel's MMIO window.
    ///
    /// The mapping is made in the kernel root; address spaces created
    /// before the window's top-level slot existed do not see it.
    ///
    /// # Errors
    /// See [`MmioWindow::map_mmio`].
    pub fn map_mmio(&self, phys: PhysicalAddress, size: u64) -> Result<VirtualAddress, VmemError> {
        let mut frames = self.frames;
        self.mmio
            .lock()
            .map_mmio(&self.kernel_space(), &mut frames, phys, size)
    }

    /// Zeroed, physically contiguous, uncached buffer for device DMA.
    ///
    /// # Errors
    /// See [`MmioWindow::alloc_dma`].
    pub fn alloc_dma(&self, pages: usize) -> Result<DmaAllocation, VmemError> {
        let mut frames = self.frames;
        self.mmio
            .lock()
            .alloc_dma(&self.kernel_space(), &mut frames, pages)
    }

    pub fn free_dma(&self, dma: DmaAllocation) {
        let mut frames = self.frames;
        self.mmio
            .lock()
            .free_dma(&self.kernel_space(), &mut frames, dma);
    }

    /// Switches an existing kernel mapping, typically the framebuffer, to
    /// write-combining.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] at the first unmapped page.
    pub fn remap_write_combining(&self, va: VirtualAddress, size: u64) -> Result<(), VmemError> {
        kernel_vmem::remap_write_combining(&self.kernel_space(), va, size)
    }
}

#[cfg(all(not(test), target_os = "none", target_arch = "x86_64"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel_qemu::qemu_trace!("kernel panic: {info}\n");
    loop {
        // SAFETY: halting with interrupts off is the end of the line.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) }
    }
}
