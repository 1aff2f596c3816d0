//! # Virtual Memory Areas
//!
//! Each process records which parts of its user half it has mapped, with
//! what permissions and for what purpose. The page-fault path asks this
//! registry whether a faulting address is legitimately the process's.
//!
//! Areas are kept sorted by start address and never overlap.

use crate::PageEntryBits;
use alloc::vec::Vec;
use kernel_info::memory::USER_SPACE_END;
use kernel_memory_addresses::{Size4K, VirtualAddress};

/// What an area is used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmaKind {
    Generic,
    Text,
    Data,
    Stack,
    Heap,
    Mmio,
    Anonymous,
}

/// One contiguous, page-aligned range `[start, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    /// Leaf flags pages of this area are mapped with.
    pub flags: PageEntryBits,
    pub kind: VmaKind,
    /// Pages may currently be shared copy-on-write.
    pub cow: bool,
}

impl Vma {
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.flags.writable()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmaError {
    #[error("empty or inverted range {start}..{end}")]
    EmptyRange {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("range {start}..{end} is not page aligned")]
    Unaligned {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("range {start}..{end} reaches into the kernel half")]
    KernelRange {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("range {start}..{end} overlaps an existing area")]
    Overlap {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("no area {start}..{end}")]
    NotFound {
        start: VirtualAddress,
        end: VirtualAddress,
    },
}

/// Per-process set of areas.
#[derive(Debug, Clone, Default)]
pub struct VmaList {
    areas: Vec<Vma>,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { areas: Vec::new() }
    }

    /// Registers `[start, end)`.
    ///
    /// # Errors
    /// If the range is empty, unaligned, leaves the user half, or overlaps
    /// an existing area.
    pub fn add(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: PageEntryBits,
        kind: VmaKind,
    ) -> Result<(), VmaError> {
        if start.as_u64() >= end.as_u64() {
            return Err(VmaError::EmptyRange { start, end });
        }
        if !start.is_aligned::<Size4K>() || !end.is_aligned::<Size4K>() {
            return Err(VmaError::Unaligned { start, end });
        }
        if end.as_u64() > USER_SPACE_END {
            return Err(VmaError::KernelRange { start, end });
        }

        let at = self.areas.partition_point(|v| v.start.as_u64() < start.as_u64());
        let clashes_prev = at > 0 && self.areas[at - 1].end.as_u64() > start.as_u64();
        let clashes_next = self
            .areas
            .get(at)
            .is_some_and(|v| v.start.as_u64() < end.as_u64());
        if clashes_prev || clashes_next {
            return Err(VmaError::Overlap { start, end });
        }

        self.areas.insert(
            at,
            Vma {
                start,
                end,
                flags,
                kind,
                cow: false,
            },
        );
        log::trace!("vma add {start}..{end} {kind:?}");
        Ok(())
    }

    /// The area containing `addr`.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<&Vma> {
        let at = self.areas.partition_point(|v| v.start.as_u64() <= addr.as_u64());
        at.checked_sub(1)
            .map(|i| &self.areas[i])
            .filter(|v| v.contains(addr))
    }

    /// Removes the area with exactly this range.
    ///
    /// # Errors
    /// [`VmaError::NotFound`] if no area matches both bounds.
    pub fn remove(&mut self, start: VirtualAddress, end: VirtualAddress) -> Result<Vma, VmaError> {
        let i = self
            .areas
            .iter()
            .position(|v| v.start == start && v.end == end)
            .ok_or(VmaError::NotFound { start, end })?;
        Ok(self.areas.remove(i))
    }

    /// Flags every writable area as copy-on-write shared.
    pub fn mark_cow(&mut self) {
        for v in self.areas.iter_mut().filter(|v| v.is_writable()) {
            v.cow = true;
        }
    }

    pub fn clear(&mut self) {
        self.areas.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

impl<'a> IntoIterator for &'a VmaList {
    type Item = &'a Vma;
    type IntoIter = core::slice::Iter<'a, Vma>;

    fn into_iter(self) -> Self::IntoIter {
        self.areas.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn list() -> VmaList {
        let mut l = VmaList::new();
        l.add(va(0x40_0000), va(0x40_4000), PageEntryBits::user_rx(), VmaKind::Text)
            .unwrap();
        l.add(va(0x60_0000), va(0x60_2000), PageEntryBits::user_rw(), VmaKind::Data)
            .unwrap();
        l
    }

    #[test]
    fn find_uses_half_open_ranges() {
        let l = list();
        assert_eq!(l.find(va(0x40_0000)).unwrap().kind, VmaKind::Text);
        assert_eq!(l.find(va(0x40_3fff)).unwrap().kind, VmaKind::Text);
        assert!(l.find(va(0x40_4000)).is_none());
        assert!(l.find(va(0x3f_ffff)).is_none());
        assert_eq!(l.find(va(0x60_1000)).unwrap().kind, VmaKind::Data);
    }

    #[test]
    fn add_rejects_bad_ranges() {
        let mut l = list();
        let rw = PageEntryBits::user_rw();
        assert!(matches!(
            l.add(va(0x1000), va(0x1000), rw, VmaKind::Heap),
            Err(VmaError::EmptyRange { .. })
        ));
        assert!(matches!(
            l.add(va(0x1000), va(0x1800), rw, VmaKind::Heap),
            Err(VmaError::Unaligned { .. })
        ));
        assert!(matches!(
            l.add(va(USER_SPACE_END - 0x1000), va(USER_SPACE_END + 0x1000), rw, VmaKind::Heap),
            Err(VmaError::KernelRange { .. })
        ));
        assert!(matches!(
            l.add(va(0x40_3000), va(0x40_5000), rw, VmaKind::Heap),
            Err(VmaError::Overlap { .. })
        ));
        assert!(matches!(
            l.add(va(0x5f_f000), va(0x60_1000), rw, VmaKind::Heap),
            Err(VmaError::Overlap { .. })
        ));
        // touching is fine
        l.add(va(0x40_4000), va(0x40_5000), rw, VmaKind::Heap).unwrap();
        assert_eq!(l.len(), 3);
        let starts: Vec<u64> = l.iter().map(|v| v.start.as_u64()).collect();
        assert_eq!(starts, [0x40_0000, 0x40_4000, 0x60_0000]);
    }

    #[test]
    fn remove_needs_exact_bounds() {
        let mut l = list();
        assert!(l.remove(va(0x40_0000), va(0x40_2000)).is_err());
        let v = l.remove(va(0x40_0000), va(0x40_4000)).unwrap();
        assert_eq!(v.kind, VmaKind::Text);
        assert!(l.find(va(0x40_0000)).is_none());
    }

    #[test]
    fn clone_is_deep_and_cow_marks_writable_only() {
        let mut parent = list();
        let mut child = parent.clone();
        child.mark_cow();
        parent.clear();

        assert!(parent.is_empty());
        assert_eq!(child.len(), 2);
        assert!(!child.find(va(0x40_0000)).unwrap().cow);
        assert!(child.find(va(0x60_0000)).unwrap().cow);
    }
}
