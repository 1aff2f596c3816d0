//! # Saved Execution State
//!
//! Two frames live on a kernel stack:
//!
//! * [`SwitchFrame`]: what [`Arch::switch_context`](crate::Arch::switch_context)
//!   pushes when a process gives up the CPU inside the kernel. Only the
//!   callee-saved registers are kept; everything else is dead across the
//!   call.
//! * [`TrapFrame`]: the full register file saved by a syscall or interrupt
//!   entry from user mode, ending in the hardware `iretq` frame. Fork
//!   copies the parent's into the child and replays it with `rax = 0`.
//!
//! ```text
//!  higher addresses
//!  ┌─────────────────────┐ ← stack top
//!  │ TrapFrame (fork)    │   ss, rsp, rflags, cs, rip, r15 … rax
//!  ├─────────────────────┤
//!  │ SwitchFrame         │   rip, rflags, rbx, rbp, r12 … r15
//!  └─────────────────────┘ ← saved sp
//!  lower addresses
//! ```

use core::mem::{align_of, size_of};

/// Callee-saved state pushed by the switch primitive, lowest address first.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SwitchFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rflags: u64,
    /// Where execution continues after the switch returns.
    pub rip: u64,
}

/// Register file of a user context, lowest address first.
///
/// The last five fields are the frame the CPU pushes on a privilege change.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// The frame a fork child resumes with: identical, except the syscall
    /// returns 0.
    #[must_use]
    pub const fn for_child(&self) -> Self {
        let mut child = *self;
        child.rax = 0;
        child
    }
}

/// `FXSAVE` image: x87, MMX and SSE state.
#[repr(C, align(16))]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    /// x87 control word after `fninit`: all exceptions masked, 64-bit precision.
    pub const DEFAULT_FCW: u16 = 0x037F;
    /// `MXCSR` at reset: all SSE exceptions masked, round to nearest.
    pub const DEFAULT_MXCSR: u32 = 0x1F80;

    /// The state of a freshly initialised FPU.
    #[must_use]
    pub const fn new() -> Self {
        let mut area = [0u8; 512];
        let fcw = Self::DEFAULT_FCW.to_le_bytes();
        area[0] = fcw[0];
        area[1] = fcw[1];
        let mxcsr = Self::DEFAULT_MXCSR.to_le_bytes();
        area[24] = mxcsr[0];
        area[25] = mxcsr[1];
        area[26] = mxcsr[2];
        area[27] = mxcsr[3];
        Self(area)
    }

    #[must_use]
    pub const fn fcw(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    #[must_use]
    pub const fn mxcsr(&self) -> u32 {
        u32::from_le_bytes([self.0[24], self.0[25], self.0[26], self.0[27]])
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState")
            .field("fcw", &format_args!("{:#06x}", self.fcw()))
            .field("mxcsr", &format_args!("{:#010x}", self.mxcsr()))
            .finish_non_exhaustive()
    }
}

const _: () = {
    assert!(size_of::<SwitchFrame>() == 8 * 8);
    assert!(size_of::<TrapFrame>() == 20 * 8);
    assert!(size_of::<TrapFrame>().is_multiple_of(16));
    assert!(size_of::<FpuState>() == 512);
    assert!(align_of::<FpuState>() == 16);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fpu_has_reset_control_words() {
        let f = FpuState::new();
        assert_eq!(f.fcw(), 0x037F);
        assert_eq!(f.mxcsr(), 0x1F80);
        assert_eq!(f.0.iter().filter(|b| **b != 0).count(), 4);
    }

    #[test]
    fn child_frame_only_differs_in_rax() {
        let parent = TrapFrame {
            rax: 57,
            rdi: 1,
            rip: 0x40_1000,
            rsp: 0x7fff_f000,
            ..TrapFrame::default()
        };
        let child = parent.for_child();
        assert_eq!(child.rax, 0);
        assert_eq!(TrapFrame { rax: 57, ..child }, parent);
    }
}
