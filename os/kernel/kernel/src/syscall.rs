//! # Process System Calls
//!
//! Register ABI (`int 0x80` or `syscall`, saved into a [`TrapFrame`]):
//!
//! | register | in                | out                              |
//! |----------|-------------------|----------------------------------|
//! | `rax`    | [`Sysno`]         | result, `-1` on failure          |
//! | `rdi`    | first argument    |                                  |
//! | `rdx`    |                   | exit status (`waitpid` only)     |
//!
//! `fork` returns the child's pid in the parent and `0` in the child.

use crate::Kernel;
use kernel_alloc::PhysMapper;
use kernel_sched::{Arch, Pid, TrapFrame, WaitTarget};

#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    Fork = 1,
    /// `exit(status)`; does not return.
    Exit = 2,
    /// `waitpid(pid)`, `-1` for any child.
    WaitPid = 3,
    /// `sleep(ticks)`
    Sleep = 4,
    /// `sleep_ms(ms)`
    SleepMs = 5,
    GetPid = 6,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Fork,
            2 => Self::Exit,
            3 => Self::WaitPid,
            4 => Self::Sleep,
            5 => Self::SleepMs,
            6 => Self::GetPid,
            other => return Err(other),
        })
    }
}

fn pid_result(pid: Pid) -> i64 {
    i64::try_from(pid.as_u64()).unwrap_or(-1)
}

impl<A: Arch, M: PhysMapper> Kernel<'_, A, M> {
    /// Dispatches the call described by `frame` and stores the result in it.
    #[allow(clippy::cast_possible_truncation)]
    pub fn syscall(&self, frame: &mut TrapFrame) {
        let ret = match Sysno::try_from(frame.rax) {
            Ok(Sysno::Fork) => self.sys_fork(frame),
            // The ABI passes the status in the low 32 bits.
            Ok(Sysno::Exit) => self.sys_exit((frame.rdi as u32).cast_signed()),
            Ok(Sysno::WaitPid) => {
                let (pid, status) = self.sys_waitpid(frame.rdi.cast_signed());
                frame.rdx = u64::from(status.cast_unsigned());
                pid
            }
            Ok(Sysno::Sleep) => self.sys_sleep(frame.rdi),
            Ok(Sysno::SleepMs) => self.sys_sleep_ms(frame.rdi),
            Ok(Sysno::GetPid) => self.sys_getpid(),
            Err(n) => {
                log::warn!("unknown syscall {n} from {}", self.sched.getpid());
                -1
            }
        };
        frame.rax = ret.cast_unsigned();
    }

    /// Child pid, or `-1`.
    pub fn sys_fork(&self, frame: &TrapFrame) -> i64 {
        match self.sched.fork(frame) {
            Ok(pid) => pid_result(pid),
            Err(e) => {
                log::debug!("fork from {} failed: {e}", self.sched.getpid());
                -1
            }
        }
    }

    pub fn sys_exit(&self, status: i32) -> ! {
        self.sched.exit(status)
    }

    /// `(child pid, exit status)`, or `(-1, 0)` if there is no matching
    /// child. Blocks while matching children are alive.
    pub fn sys_waitpid(&self, pid: i64) -> (i64, i32) {
        let Some(target) = WaitTarget::from_raw(pid) else {
            return (-1, 0);
        };
        match self.sched.waitpid(target) {
            Ok((child, status)) => (pid_result(child), status),
            Err(_) => (-1, 0),
        }
    }

    pub fn sys_sleep(&self, ticks: u64) -> i64 {
        self.sched.sleep(ticks);
        0
    }

    pub fn sys_sleep_ms(&self, ms: u64) -> i64 {
        self.sched.sleep_ms(ms);
        0
    }

    pub fn sys_getpid(&self) -> i64 {
        pid_result(self.sched.getpid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip_and_reject_unknown() {
        for n in 1..=6 {
            assert_eq!(Sysno::try_from(n).map(|s| s as u64), Ok(n));
        }
        assert_eq!(Sysno::try_from(0), Err(0));
        assert_eq!(Sysno::try_from(99), Err(99));
    }
}
