//! The kernel-wide frame allocator behind an interrupt-safe lock.

use crate::{BitmapFrameAlloc, FrameAlloc, FrameAllocError};
use kernel_memory_addresses::PhysicalFrame;
use kernel_sync::{InterruptControl, SpinLock, SpinLockGuard};

/// A [`BitmapFrameAlloc`] that many owners can use at once.
///
/// `&SharedFrameAlloc` implements [`FrameAlloc`] and is `Copy`, so it can be
/// handed to every address space and to the scheduler. Each call takes the
/// lock for just that call.
pub struct SharedFrameAlloc<'a, I: InterruptControl> {
    inner: SpinLock<BitmapFrameAlloc<'a>, I>,
}

impl<'a, I: InterruptControl> SharedFrameAlloc<'a, I> {
    pub const fn new(alloc: BitmapFrameAlloc<'a>) -> Self {
        Self {
            inner: SpinLock::new(alloc),
        }
    }

    /// Locks the allocator for a batch of operations or for statistics.
    pub fn lock(&self) -> SpinLockGuard<'_, BitmapFrameAlloc<'a>, I> {
        self.inner.lock()
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().free_bytes()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes()
    }

    pub fn free_frames_count(&self) -> usize {
        self.inner.lock().free_frames()
    }
}

impl<I: InterruptControl> FrameAlloc for &SharedFrameAlloc<'_, I> {
    fn alloc_frame(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
        self.inner.with_lock(BitmapFrameAlloc::alloc_frame)
    }

    fn alloc_frames(&mut self, count: usize) -> Result<PhysicalFrame, FrameAllocError> {
        self.inner.with_lock(|a| a.alloc_frames(count))
    }

    fn free_frames(&mut self, first: PhysicalFrame, count: usize) {
        self.inner.with_lock(|a| a.free_frames(first, count));
    }

    fn refcount_inc(&mut self, frame: PhysicalFrame) {
        self.inner.with_lock(|a| a.refcount_inc(frame));
    }

    fn refcount_dec(&mut self, frame: PhysicalFrame) {
        self.inner.with_lock(|a| a.refcount_dec(frame));
    }

    fn refcount(&self, frame: PhysicalFrame) -> u16 {
        self.inner.lock().refcount(frame)
    }
}
