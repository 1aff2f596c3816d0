use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Page-aligned base of a physical page of size `S`.
///
/// The low `S::SHIFT` bits are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

/// A 4 KiB physical frame, the allocator's unit.
pub type PhysicalFrame = PhysicalPage<Size4K>;

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::MASK,
            _size: PhantomData,
        }
    }

    /// `None` unless `addr` is already `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    /// Page number `n`, i.e. base `n << S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn from_number(n: u64) -> Self {
        Self {
            base: n << S::SHIFT,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.base >> S::SHIFT
    }

    /// The page `n` pages further up.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self::from_number(self.number() + n)
    }

    /// `base + offset`; the offset must stay inside the page.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < S::SIZE);
        PhysicalAddress::new(self.base | (offset & S::MASK))
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", size_name::<S>(), self.base)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.base)
    }
}

/// Page-aligned base of a virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::MASK,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    /// The page `n` pages further up. Wraps like the address arithmetic does.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self {
            base: self.base.wrapping_add(n << S::SHIFT),
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", size_name::<S>(), self.base)
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.base)
    }
}

fn size_name<S: PageSize>() -> &'static str {
    match S::SHIFT {
        12 => "4K",
        21 => "2M",
        _ => "1G",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size2M;

    #[test]
    fn frame_numbers_and_bases_agree() {
        let f = PhysicalPage::<Size4K>::from_number(0x10);
        assert_eq!(f.base().as_u64(), 0x1_0000);
        assert_eq!(f.add(2).number(), 0x12);
        assert_eq!(f.join(0x34).as_u64(), 0x1_0034);
    }

    #[test]
    fn from_aligned_rejects_misaligned() {
        assert!(PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x1000)).is_none());
        assert!(PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x20_0000)).is_some());
        assert!(VirtualPage::<Size4K>::from_aligned(VirtualAddress::new(0x1001)).is_none());
    }
}
