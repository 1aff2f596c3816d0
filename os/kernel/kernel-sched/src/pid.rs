//! Process identifiers.

use core::fmt;

/// A process id. Pid 0 is the kernel process; others count up from 1 and
/// are never reused while the system runs.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Pid(u64);

impl Pid {
    /// The kernel process: adopts the boot context, adopts orphans and idles.
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Pid> for u64 {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// Which children a `waitpid` is interested in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

impl WaitTarget {
    /// Decodes the syscall argument: `-1` means any child.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(Self::Any),
            r if r > 0 => Some(Self::Pid(Pid(r.unsigned_abs()))),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn matches(self, pid: Pid) -> bool {
        match self {
            Self::Any => true,
            Self::Pid(p) => p == pid,
        }
    }
}
