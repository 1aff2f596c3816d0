//! # Physical Memory for the Kernel
//!
//! Hands out 4 KiB physical frames and keeps a share count for each of them,
//! so that copy-on-write mappings can point several address spaces at the
//! same frame.
//!
//! ```text
//! ┌──────────────────────────────┐    ┌───────────────────────────┐
//! │ BitmapFrameAlloc             │    │ PhysMapper                │
//! │  • 1 bit per frame           │    │  • phys → kernel pointer  │
//! │  • u16 refcount per frame    │    │  • HHDM in the kernel     │
//! │  • first-fit from a hint     │    │  • heap buffer in tests   │
//! └──────────────┬───────────────┘    └───────────────────────────┘
//!                │
//! ┌──────────────▼───────────────┐
//! │ SharedFrameAlloc             │
//! │  • IRQ-safe spinlock         │
//! │  • `&SharedFrameAlloc` is a  │
//! │    copyable allocator handle │
//! └──────────────────────────────┘
//! ```
//!
//! Invariants kept by every allocator here:
//!
//! * a frame's refcount is zero exactly when its bitmap bit is clear;
//! * frame 0 and frames outside usable RAM are never returned;
//! * freeing a frame that is already free is tolerated and changes nothing.
//!
//! ## Features
//!
//! `sim` exposes [`sim::SimPhys`], a heap-backed stand-in for physical RAM
//! that higher crates use in their tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bitmap;
pub mod frame_alloc;
pub mod phys_mapper;
pub mod shared;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use frame_alloc::{BitmapFrameAlloc, PINNED, StorageLayout};
pub use phys_mapper::{HhdmPhysMapper, PhysMapper};
pub use shared::SharedFrameAlloc;

use kernel_memory_addresses::PhysicalFrame;

/// Errors reported by frame allocators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("frame count must be at least one")]
    InvalidCount,
    #[error("allocator storage too small for {frames} frames")]
    StorageTooSmall { frames: usize },
    #[error("memory map contains no usable RAM")]
    NoUsableMemory,
}

/// A source of 4 KiB physical frames with per-frame share counts.
///
/// Fresh frames come back with a count of one. Page-table code bumps the
/// count when it shares a frame and drops it when a mapping goes away; the
/// frame is returned to the pool when the count hits zero.
pub trait FrameAlloc {
    /// One frame. Contents are unspecified.
    fn alloc_frame(&mut self) -> Result<PhysicalFrame, FrameAllocError>;

    /// `count` physically contiguous frames; returns the first.
    fn alloc_frames(&mut self, count: usize) -> Result<PhysicalFrame, FrameAllocError>;

    /// Drops one reference to `frame`.
    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.refcount_dec(frame);
    }

    /// Drops one reference to each of `count` frames starting at `first`.
    fn free_frames(&mut self, first: PhysicalFrame, count: usize) {
        for n in 0..count as u64 {
            self.refcount_dec(first.add(n));
        }
    }

    /// Records another sharer of an allocated frame.
    fn refcount_inc(&mut self, frame: PhysicalFrame);

    /// Removes a sharer; frees the frame when none remain.
    fn refcount_dec(&mut self, frame: PhysicalFrame);

    /// Current share count. Zero for free or unknown frames.
    fn refcount(&self, frame: PhysicalFrame) -> u16;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_frame(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
        (**self).alloc_frame()
    }

    fn alloc_frames(&mut self, count: usize) -> Result<PhysicalFrame, FrameAllocError> {
        (**self).alloc_frames(count)
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        (**self).free_frame(frame);
    }

    fn free_frames(&mut self, first: PhysicalFrame, count: usize) {
        (**self).free_frames(first, count);
    }

    fn refcount_inc(&mut self, frame: PhysicalFrame) {
        (**self).refcount_inc(frame);
    }

    fn refcount_dec(&mut self, frame: PhysicalFrame) {
        (**self).refcount_dec(frame);
    }

    fn refcount(&self, frame: PhysicalFrame) -> u16 {
        (**self).refcount(frame)
    }
}
