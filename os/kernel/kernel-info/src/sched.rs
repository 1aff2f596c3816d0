//! # Scheduler Configuration

/// Number of sentinel words written at the base of every kernel stack.
pub const STACK_GUARD_WORDS: usize = 8;

/// Sentinel value checked before every switch away from a process.
pub const STACK_GUARD_PATTERN: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Upper bound on live process table entries, zombies included.
pub const MAX_PROCESSES: usize = 256;

/// Slots in a process's open-file table.
pub const MAX_OPEN_FILES: usize = 16;

/// Longest process name kept, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Programmed timer rate. One tick is one millisecond.
pub const TIMER_FREQUENCY_HZ: u64 = 1000;

/// `RFLAGS` for a fresh context: interrupts enabled, reserved bit 1 set.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Exit status of a process killed by a page fault it could not survive.
pub const FAULT_EXIT_STATUS: i32 = -1;

const _: () = {
    assert!(STACK_GUARD_WORDS * 8 < crate::memory::KERNEL_STACK_SIZE);
    assert!(MAX_PROCESSES > 1);
    assert!(TIMER_FREQUENCY_HZ > 0);
};
