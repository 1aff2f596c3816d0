use crate::{PageSize, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Highest address of the lower (user) canonical half, exclusive.
const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address of the upper (kernel) canonical half.
const UPPER_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// Virtual memory address.
///
/// Besides the alignment helpers shared with
/// [`PhysicalAddress`](crate::PhysicalAddress), a virtual address knows which
/// canonical half it lives in and how it splits into the four page-table
/// indices.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FF80_0000_0000);
/// assert!(va.is_kernel());
/// assert_eq!(va.table_index(4), 511);
/// assert_eq!(va.table_index(1), 0);
///
/// assert!(!VirtualAddress::new(0x0000_9000_0000_0000).is_canonical());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    /// Rounds up to the next `S` boundary. Saturates at the last page.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        match self.0.checked_add(S::MASK) {
            Some(v) => Self(v & !S::MASK),
            None => Self(u64::MAX & !S::MASK),
        }
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    /// Bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 < LOWER_HALF_END || self.0 >= UPPER_HALF_START
    }

    /// Lower canonical half.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 < LOWER_HALF_END
    }

    /// Upper canonical half.
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 >= UPPER_HALF_START
    }

    /// Index into the table at `level` (4 = PML4 … 1 = PT).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, level: u8) -> usize {
        debug_assert!(level >= 1 && level <= 4);
        let shift = 12 + 9 * (level as u32 - 1);
        ((self.0 >> shift) & 0x1FF) as usize
    }

    /// Reassembles a canonical address from four table indices.
    #[inline]
    #[must_use]
    pub const fn from_indices(l4: usize, l3: usize, l2: usize, l1: usize) -> Self {
        let raw = ((l4 as u64 & 0x1FF) << 39)
            | ((l3 as u64 & 0x1FF) << 30)
            | ((l2 as u64 & 0x1FF) << 21)
            | ((l1 as u64 & 0x1FF) << 12);
        // sign-extend bit 47
        if raw & (1 << 47) != 0 {
            Self(raw | 0xFFFF_0000_0000_0000)
        } else {
            Self(raw)
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip_through_both_halves() {
        for raw in [0x0000_0000_0040_1000_u64, 0xFFFF_FFFF_9000_3000] {
            let va = VirtualAddress::new(raw);
            let back = VirtualAddress::from_indices(
                va.table_index(4),
                va.table_index(3),
                va.table_index(2),
                va.table_index(1),
            );
            assert_eq!(back, va);
        }
    }

    #[test]
    fn halves_are_disjoint() {
        let top_user = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
        let bottom_kernel = VirtualAddress::new(0xFFFF_8000_0000_0000);
        assert!(top_user.is_user() && !top_user.is_kernel());
        assert!(bottom_kernel.is_kernel() && !bottom_kernel.is_user());
    }
}
