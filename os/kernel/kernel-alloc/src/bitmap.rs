//! One bit per 4 KiB frame: set = used, clear = free.

/// Bit array over caller-provided words.
pub struct FrameBitmap<'a> {
    words: &'a mut [u64],
    bits: usize,
}

impl<'a> FrameBitmap<'a> {
    /// Number of `u64` words needed for `bits` bits.
    #[must_use]
    pub const fn words_for(bits: usize) -> usize {
        bits.div_ceil(64)
    }

    /// Wraps `words`; every bit starts set (used).
    ///
    /// # Panics
    /// If `words` cannot hold `bits` bits.
    pub fn new_all_used(words: &'a mut [u64], bits: usize) -> Self {
        assert!(words.len() >= Self::words_for(bits), "bitmap storage too small");
        words.fill(u64::MAX);
        Self { words, bits }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Out-of-range indices read as used.
    #[inline]
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.bits {
            return true;
        }
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Out-of-range indices are ignored.
    #[inline]
    pub fn set(&mut self, index: usize, used: bool) {
        if index >= self.bits {
            return;
        }
        let mask = 1 << (index % 64);
        if used {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
    }

    pub fn set_range(&mut self, start: usize, count: usize, used: bool) {
        for i in start..start.saturating_add(count) {
            self.set(i, used);
        }
    }

    /// First clear bit in `[from, end)`, skipping full words.
    fn find_clear_in(&self, from: usize, end: usize) -> Option<usize> {
        let mut i = from;
        while i < end {
            let word = self.words[i / 64];
            if word == u64::MAX && i.is_multiple_of(64) {
                i += 64;
                continue;
            }
            if word & (1 << (i % 64)) == 0 {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// First clear bit at or after `hint`, wrapping around to the start once.
    #[must_use]
    pub fn find_clear_from(&self, hint: usize) -> Option<usize> {
        let hint = hint.min(self.bits);
        self.find_clear_in(hint, self.bits)
            .or_else(|| self.find_clear_in(0, hint))
    }

    /// First index of `count` consecutive clear bits.
    #[must_use]
    pub fn find_clear_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut i = 0;
        while i < self.bits {
            if self.is_set(i) {
                run_len = 0;
                // Skip the rest of a full word in one step.
                if i.is_multiple_of(64) && self.words[i / 64] == u64::MAX {
                    i += 64;
                    continue;
                }
            } else {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            i += 1;
        }
        None
    }
}
