//! # Physical Frame Allocator
//!
//! Bitmap of used frames plus one `u16` share count per frame.
//!
//! * A frame is free exactly when its count is zero and its bit is clear.
//! * Allocation is first-fit starting at a moving hint and wraps around once;
//!   a free moves the hint back down so low frames get reused first.
//! * Counts above one only arise from copy-on-write sharing. A frame returns
//!   to the pool when the last sharer drops it.
//! * Frames that are not RAM the allocator owns (firmware, the allocator's own
//!   storage) carry [`PINNED`]: used, and never freed by a decrement.

use crate::bitmap::FrameBitmap;
use crate::phys_mapper::PhysMapper;
use crate::{FrameAlloc, FrameAllocError};
use kernel_info::boot::{MemoryKind, MemoryRegion};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, Size4K};

const FRAME: u64 = FRAME_SIZE as u64;

/// Share count of frames that can never return to the pool.
pub const PINNED: u16 = u16::MAX;

/// Allocator state for all physical RAM reported at boot.
pub struct BitmapFrameAlloc<'a> {
    bitmap: FrameBitmap<'a>,
    refcounts: &'a mut [u16],
    /// Highest frame index that was usable at boot. Nothing above is handed out.
    highest_frame: usize,
    next_hint: usize,
    total_frames: usize,
    free_frames: usize,
}

/// Storage the allocator needs for a given memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StorageLayout {
    /// Frames covered (from physical address 0 up to the highest RAM byte).
    pub frames: usize,
    /// `u64` words of bitmap.
    pub bitmap_words: usize,
}

impl StorageLayout {
    /// Sizes the bitmap for every byte of addressable RAM in `regions`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_regions(regions: &[MemoryRegion]) -> Self {
        let highest = regions
            .iter()
            .filter(|r| r.kind.is_addressable_ram())
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0);
        let frames = highest.div_ceil(FRAME) as usize;
        Self {
            frames,
            bitmap_words: FrameBitmap::words_for(frames),
        }
    }

    /// Bytes of bitmap plus refcounts, rounded up to whole frames each.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        Self::frames_for(self.bitmap_words * 8) * FRAME + Self::frames_for(self.frames * 2) * FRAME
    }

    const fn frames_for(bytes: usize) -> u64 {
        (bytes as u64).div_ceil(FRAME)
    }
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Builds the allocator over caller-provided storage.
    ///
    /// Every frame starts used; the whole frames inside
    /// [`MemoryKind::Usable`] regions are then released. Frame 0 is never
    /// released.
    pub fn new(
        regions: &[MemoryRegion],
        bitmap_words: &'a mut [u64],
        refcounts: &'a mut [u16],
    ) -> Result<Self, FrameAllocError> {
        let layout = StorageLayout::for_regions(regions);
        if bitmap_words.len() < layout.bitmap_words || refcounts.len() < layout.frames {
            return Err(FrameAllocError::StorageTooSmall {
                frames: layout.frames,
            });
        }

        let bitmap = FrameBitmap::new_all_used(bitmap_words, layout.frames);
        let refcounts = &mut refcounts[..layout.frames];
        refcounts.fill(PINNED);

        let mut alloc = Self {
            bitmap,
            refcounts,
            highest_frame: 0,
            next_hint: 0,
            total_frames: 0,
            free_frames: 0,
        };

        for region in regions.iter().filter(|r| r.kind == MemoryKind::Usable) {
            alloc.release_region(region);
        }

        if alloc.total_frames == 0 {
            return Err(FrameAllocError::NoUsableMemory);
        }

        log::info!(
            "frame allocator: {} KiB usable in {} frames, highest frame {:#x}",
            alloc.total_bytes() / 1024,
            alloc.total_frames,
            alloc.highest_frame
        );
        Ok(alloc)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn release_region(&mut self, region: &MemoryRegion) {
        let start = PhysicalAddress::new(region.base).align_up::<Size4K>().as_u64();
        let end = PhysicalAddress::new(region.end()).align_down::<Size4K>().as_u64();
        let first = (start / FRAME).max(1) as usize;
        let last = ((end / FRAME) as usize).min(self.bitmap.len());

        for idx in first..last {
            if !self.bitmap.is_set(idx) {
                continue;
            }
            self.bitmap.set(idx, false);
            self.refcounts[idx] = 0;
            self.total_frames += 1;
            self.free_frames += 1;
            self.highest_frame = self.highest_frame.max(idx);
        }
    }

    /// Marks `count` frames starting at `first` as permanently used.
    ///
    /// Used at boot for frames that must never be handed out (the allocator's
    /// own storage, loader structures still in use).
    pub fn reserve(&mut self, first: PhysicalFrame, count: usize) {
        let Ok(start) = usize::try_from(first.number()) else {
            return;
        };
        for idx in start..start.saturating_add(count) {
            if idx < self.bitmap.len() && !self.bitmap.is_set(idx) {
                self.bitmap.set(idx, true);
                self.refcounts[idx] = PINNED;
                self.free_frames -= 1;
            }
        }
    }

    /// Builds the allocator in place, carving its own storage out of the
    /// first usable region large enough to hold it.
    ///
    /// # Safety
    /// `mapper` must map all of usable RAM, and the carved frames must not be
    /// in use by anyone else. The returned allocator borrows that memory for
    /// the rest of the kernel's life.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn bootstrap<M: PhysMapper>(
        regions: &[MemoryRegion],
        mapper: &M,
    ) -> Result<BitmapFrameAlloc<'static>, FrameAllocError> {
        let layout = StorageLayout::for_regions(regions);
        let needed = layout.bytes();

        let home = regions
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .map(|r| {
                let base = PhysicalAddress::new(r.base.max(FRAME)).align_up::<Size4K>();
                (base, r.end().saturating_sub(base.as_u64()))
            })
            .find(|(_, len)| *len >= needed)
            .ok_or(FrameAllocError::StorageTooSmall {
                frames: layout.frames,
            })?;

        let storage = home.0;
        let bitmap_bytes = StorageLayout::frames_for(layout.bitmap_words * 8) * FRAME;
        let counts_at = storage + bitmap_bytes;

        // SAFETY: both ranges lie inside a usable region reserved below and
        // are 4 KiB aligned; the caller guarantees nobody else uses them.
        let (words, counts) = unsafe {
            let words = core::slice::from_raw_parts_mut(
                mapper.phys_to_virt(storage).as_mut_ptr::<u64>(),
                layout.bitmap_words,
            );
            let counts = core::slice::from_raw_parts_mut(
                mapper.phys_to_virt(counts_at).as_mut_ptr::<u16>(),
                layout.frames,
            );
            (words, counts)
        };

        let mut alloc = BitmapFrameAlloc::new(regions, words, counts)?;
        alloc.reserve(storage.page::<Size4K>(), (needed / FRAME) as usize);
        log::debug!(
            "frame allocator storage at {storage} ({} KiB)",
            needed / 1024
        );
        Ok(alloc)
    }

    fn index_of(&self, frame: PhysicalFrame) -> Option<usize> {
        usize::try_from(frame.number())
            .ok()
            .filter(|idx| *idx < self.bitmap.len())
    }

    /// Whether the frame is currently handed out (or reserved).
    #[must_use]
    pub fn is_used(&self, frame: PhysicalFrame) -> bool {
        self.index_of(frame).is_none_or(|idx| self.bitmap.is_set(idx))
    }

    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_frames as u64 * FRAME
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_frames as u64 * FRAME
    }

    /// Frames covered by the bitmap (0 up to the highest RAM byte).
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.bitmap.len()
    }

    fn take(&mut self, idx: usize, count: usize) {
        self.bitmap.set_range(idx, count, true);
        self.refcounts[idx..idx + count].fill(1);
        self.free_frames -= count;
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_frame(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
        let idx = self
            .bitmap
            .find_clear_from(self.next_hint)
            .filter(|idx| *idx <= self.highest_frame)
            .ok_or(FrameAllocError::OutOfMemory)?;

        self.take(idx, 1);
        self.next_hint = idx + 1;
        let frame = PhysicalFrame::from_number(idx as u64);
        log::trace!("alloc frame {frame}");
        Ok(frame)
    }

    fn alloc_frames(&mut self, count: usize) -> Result<PhysicalFrame, FrameAllocError> {
        match count {
            0 => Err(FrameAllocError::InvalidCount),
            1 => self.alloc_frame(),
            _ => {
                let idx = self
                    .bitmap
                    .find_clear_run(count)
                    .filter(|idx| idx + count - 1 <= self.highest_frame)
                    .ok_or(FrameAllocError::OutOfMemory)?;
                self.take(idx, count);
                let first = PhysicalFrame::from_number(idx as u64);
                log::trace!("alloc {count} frames at {first}");
                Ok(first)
            }
        }
    }

    fn refcount_inc(&mut self, frame: PhysicalFrame) {
        let Some(idx) = self.index_of(frame) else {
            return;
        };
        debug_assert!(self.bitmap.is_set(idx), "refcount_inc on free frame {frame}");
        match self.refcounts[idx] {
            0 => log::warn!("refcount_inc on free frame {frame} ignored"),
            PINNED => {}
            n => {
                if n + 1 == PINNED {
                    log::warn!("refcount of {frame} saturated; frame pinned");
                }
                self.refcounts[idx] = n + 1;
            }
        }
    }

    fn refcount_dec(&mut self, frame: PhysicalFrame) {
        let Some(idx) = self.index_of(frame) else {
            return;
        };
        match self.refcounts[idx] {
            // Already free: tolerated.
            0 => log::warn!("free of free frame {frame} ignored"),
            PINNED => log::trace!("free of pinned frame {frame} ignored"),
            1 => {
                self.refcounts[idx] = 0;
                self.bitmap.set(idx, false);
                self.free_frames += 1;
                self.next_hint = self.next_hint.min(idx);
                log::trace!("free frame {frame}");
            }
            n => self.refcounts[idx] = n - 1,
        }
    }

    fn refcount(&self, frame: PhysicalFrame) -> u16 {
        self.index_of(frame).map_or(0, |idx| self.refcounts[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 64 frames of RAM: frame 0 reserved by the map itself, 1..32 and 40..64 usable.
    fn regions() -> [MemoryRegion; 3] {
        [
            MemoryRegion::usable(0, 32 * FRAME),
            MemoryRegion::new(32 * FRAME, 8 * FRAME, MemoryKind::Reserved),
            MemoryRegion::usable(40 * FRAME, 24 * FRAME),
        ]
    }

    fn with_alloc(f: impl FnOnce(&mut BitmapFrameAlloc<'_>)) {
        let mut words = [0u64; 1];
        let mut counts = [0u16; 64];
        let mut a = BitmapFrameAlloc::new(&regions(), &mut words, &mut counts).unwrap();
        f(&mut a);
    }

    fn assert_refcount_matches_bitmap(a: &BitmapFrameAlloc<'_>) {
        for n in 0..a.frame_count() as u64 {
            let f = PhysicalFrame::from_number(n);
            assert_eq!(a.refcount(f) == 0, !a.is_used(f), "frame {n}");
        }
    }

    #[test]
    fn init_frees_only_usable_frames_and_never_frame_zero() {
        with_alloc(|a| {
            assert_eq!(a.total_frames(), 31 + 24);
            assert_eq!(BitmapFrameAlloc::free_frames(a), a.total_frames());
            assert!(a.is_used(PhysicalFrame::from_number(0)));
            assert!(a.is_used(PhysicalFrame::from_number(35)));
            assert!(!a.is_used(PhysicalFrame::from_number(1)));
            assert_refcount_matches_bitmap(a);
        });
    }

    #[test]
    fn first_fit_then_hint_moves_back_on_free() {
        with_alloc(|a| {
            let f1 = a.alloc_frame().unwrap();
            let f2 = a.alloc_frame().unwrap();
            assert_eq!(f1.number(), 1);
            assert_eq!(f2.number(), 2);

            a.free_frame(f1);
            assert_eq!(a.alloc_frame().unwrap(), f1);
            assert_refcount_matches_bitmap(a);
        });
    }

    #[test]
    fn contiguous_runs_skip_holes_and_reserved_ranges() {
        with_alloc(|a| {
            let run = a.alloc_frames(30).unwrap();
            assert_eq!(run.number(), 1);
            // 1 frame left below the reserved hole; the next run must land above it.
            let run2 = a.alloc_frames(4).unwrap();
            assert_eq!(run2.number(), 40);
            assert_eq!(a.alloc_frames(0), Err(FrameAllocError::InvalidCount));
            assert_eq!(a.alloc_frames(64), Err(FrameAllocError::OutOfMemory));
            assert_refcount_matches_bitmap(a);
        });
    }

    #[test]
    fn shared_frames_return_only_after_last_drop() {
        with_alloc(|a| {
            let f = a.alloc_frame().unwrap();
            a.refcount_inc(f);
            assert_eq!(a.refcount(f), 2);

            a.refcount_dec(f);
            assert!(a.is_used(f));
            assert_eq!(a.refcount(f), 1);

            a.free_frame(f);
            assert!(!a.is_used(f));
            assert_eq!(a.refcount(f), 0);
        });
    }

    #[test]
    fn double_free_is_a_no_op() {
        with_alloc(|a| {
            let f = a.alloc_frame().unwrap();
            let free_before = BitmapFrameAlloc::free_frames(a);
            a.free_frame(f);
            a.free_frame(f);
            assert_eq!(BitmapFrameAlloc::free_frames(a), free_before + 1);
            assert_refcount_matches_bitmap(a);
        });
    }

    #[test]
    fn reserved_frames_are_pinned() {
        with_alloc(|a| {
            let hole = PhysicalFrame::from_number(33);
            assert_eq!(a.refcount(hole), PINNED);
            a.free_frame(hole);
            assert!(a.is_used(hole));

            let f = PhysicalFrame::from_number(5);
            a.reserve(f, 1);
            a.free_frame(f);
            assert!(a.is_used(f));
            assert_refcount_matches_bitmap(a);
        });
    }

    #[test]
    fn exhaust_free_one_and_reallocate() {
        with_alloc(|a| {
            let mut frames = Vec::new();
            while let Ok(f) = a.alloc_frame() {
                frames.push(f);
            }
            assert_eq!(frames.len(), 55);
            assert_eq!(a.alloc_frame(), Err(FrameAllocError::OutOfMemory));
            assert_eq!(a.free_bytes(), 0);

            let victim = frames[17];
            a.free_frame(victim);
            assert_eq!(a.alloc_frame(), Ok(victim));
        });
    }

    #[test]
    fn frames_above_highest_usable_are_never_returned() {
        let map = [
            MemoryRegion::usable(0, 4 * FRAME),
            MemoryRegion::new(4 * FRAME, 60 * FRAME, MemoryKind::BootloaderReclaimable),
        ];
        let mut words = [0u64; 1];
        let mut counts = [0u16; 64];
        let mut a = BitmapFrameAlloc::new(&map, &mut words, &mut counts).unwrap();
        assert_eq!(a.frame_count(), 64);
        for _ in 0..3 {
            assert!(a.alloc_frame().unwrap().number() < 4);
        }
        assert_eq!(a.alloc_frame(), Err(FrameAllocError::OutOfMemory));
    }

    #[test]
    fn rejects_short_storage_and_empty_maps() {
        let mut words = [0u64; 1];
        let mut counts = [0u16; 8];
        assert!(matches!(
            BitmapFrameAlloc::new(&regions(), &mut words, &mut counts),
            Err(FrameAllocError::StorageTooSmall { frames: 64 })
        ));

        let mut counts = [0u16; 64];
        let reserved = [MemoryRegion::new(0, 64 * FRAME, MemoryKind::AcpiNvs)];
        assert!(matches!(
            BitmapFrameAlloc::new(&reserved, &mut words, &mut counts),
            Err(FrameAllocError::NoUsableMemory)
        ));
    }
}
