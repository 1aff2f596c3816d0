//! # Process Control Block

use crate::context::FpuState;
use crate::pid::{Pid, WaitTarget};
use crate::stack::KernelStack;
use core::fmt;
use kernel_info::sched::{MAX_NAME_LEN, MAX_OPEN_FILES};
use kernel_vmem::{RootPage, VmaList};

/// Lifecycle of a process.
///
/// ```text
///            schedule                     exit
///   Ready ◄──────────► Running ─────────────────► Zombie ──► (reaped)
///     ▲                   │
///     │  wake / tick      │ mutex, sleep, wait
///     └───── Blocked, Sleeping, Waiting ◄┘
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    Ready,
    Running,
    /// Waiting for a [`SleepMutex`](kernel_sync::SleepMutex).
    Blocked,
    /// Until the tick count reaches `until`.
    Sleeping { until: u64 },
    /// In `waitpid` until a matching child exits.
    Waiting(WaitTarget),
    /// Exited; kept until the parent collects `status`.
    Zombie { status: i32 },
}

impl ProcessState {
    #[inline]
    #[must_use]
    pub const fn is_zombie(self) -> bool {
        matches!(self, Self::Zombie { .. })
    }
}

/// A process name, truncated to [`MAX_NAME_LEN`] bytes on a character
/// boundary.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ProcessName {
    bytes: [u8; MAX_NAME_LEN],
    len: u8,
}

impl ProcessName {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; MAX_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            bytes,
            len: u8::try_from(len).unwrap_or(u8::MAX),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Built from a `&str` cut at a character boundary.
        core::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or_default()
    }
}

impl fmt::Debug for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open file as the filesystem layer identifies it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileHandle(pub u64);

/// Per-process descriptor table. Fork copies it; the handles are shared.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FileTable {
    slots: [Option<FileHandle>; MAX_OPEN_FILES],
}

impl FileTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }

    /// Puts `handle` in the lowest free slot and returns its descriptor.
    pub fn install(&mut self, handle: FileHandle) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(handle);
        Some(fd)
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    /// Frees a descriptor, returning what it held.
    pub fn close(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd)?.take()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// The schedulable unit.
///
/// Boxed in the process table, so the saved stack pointer has a stable
/// address while the process is switched out.
#[repr(C, align(16))]
pub struct Process {
    pub(crate) fpu: FpuState,
    pub(crate) saved_sp: u64,
    pub(crate) pid: Pid,
    pub(crate) parent: Pid,
    pub(crate) name: ProcessName,
    pub(crate) state: ProcessState,
    pub(crate) stack: Option<KernelStack>,
    pub(crate) address_space: Option<RootPage>,
    pub(crate) files: FileTable,
    pub(crate) vmas: VmaList,
    pub(crate) cpu_ticks: u64,
}

impl Process {
    /// The boot context, running on the loader's stack in the kernel's
    /// address space.
    #[must_use]
    pub fn kernel() -> Self {
        Self {
            fpu: FpuState::new(),
            saved_sp: 0,
            pid: Pid::KERNEL,
            parent: Pid::KERNEL,
            name: ProcessName::new("kernel"),
            state: ProcessState::Running,
            stack: None,
            address_space: None,
            files: FileTable::new(),
            vmas: VmaList::new(),
            cpu_ticks: 0,
        }
    }

    pub(crate) fn new(pid: Pid, parent: Pid, name: ProcessName, stack: KernelStack, saved_sp: u64) -> Self {
        Self {
            fpu: FpuState::new(),
            saved_sp,
            pid,
            parent,
            name,
            state: ProcessState::Ready,
            stack: Some(stack),
            address_space: None,
            files: FileTable::new(),
            vmas: VmaList::new(),
            cpu_ticks: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Pid {
        self.parent
    }

    #[must_use]
    pub const fn name(&self) -> &ProcessName {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Root of the private address space; `None` for kernel tasks.
    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> Option<RootPage> {
        self.address_space
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> Option<&KernelStack> {
        self.stack.as_ref()
    }

    #[must_use]
    pub const fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    pub const fn vmas_mut(&mut self) -> &mut VmaList {
        &mut self.vmas
    }

    #[must_use]
    pub const fn files(&self) -> &FileTable {
        &self.files
    }

    pub const fn files_mut(&mut self) -> &mut FileTable {
        &mut self.files
    }

    #[must_use]
    pub const fn cpu_ticks(&self) -> u64 {
        self.cpu_ticks
    }

    #[must_use]
    pub const fn saved_sp(&self) -> u64 {
        self.saved_sp
    }

    #[must_use]
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent: self.parent,
            name: self.name,
            state: self.state,
            cpu_ticks: self.cpu_ticks,
            user: self.address_space.is_some(),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("address_space", &self.address_space)
            .field("cpu_ticks", &self.cpu_ticks)
            .finish_non_exhaustive()
    }
}

/// A copy of the interesting parts of a [`Process`], for listings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent: Pid,
    pub name: ProcessName,
    pub state: ProcessState,
    pub cpu_ticks: u64,
    /// Has a private address space.
    pub user: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_cut_on_char_boundaries() {
        assert_eq!(ProcessName::new("init").as_str(), "init");
        let long = "ä".repeat(MAX_NAME_LEN);
        let name = ProcessName::new(&long);
        assert_eq!(name.as_str().len(), MAX_NAME_LEN);
        assert!(name.as_str().chars().all(|c| c == 'ä'));

        let odd = format!("a{}", "ä".repeat(MAX_NAME_LEN));
        assert_eq!(ProcessName::new(&odd).as_str().len(), MAX_NAME_LEN - 1);
    }

    #[test]
    fn file_table_reuses_lowest_slot() {
        let mut files = FileTable::new();
        assert_eq!(files.install(FileHandle(10)), Some(0));
        assert_eq!(files.install(FileHandle(11)), Some(1));
        assert_eq!(files.close(0), Some(FileHandle(10)));
        assert_eq!(files.install(FileHandle(12)), Some(0));
        assert_eq!(files.get(1), Some(FileHandle(11)));
        assert_eq!(files.get(MAX_OPEN_FILES), None);
        assert_eq!(files.close(MAX_OPEN_FILES + 3), None);

        for n in 0..MAX_OPEN_FILES as u64 - 2 {
            assert!(files.install(FileHandle(100 + n)).is_some());
        }
        assert_eq!(files.open_count(), MAX_OPEN_FILES);
        assert_eq!(files.install(FileHandle(99)), None);
    }

    #[test]
    fn pcb_is_16_byte_aligned() {
        assert_eq!(align_of::<Process>(), 16);
        let p = Process::kernel();
        assert_eq!(core::ptr::from_ref(&p.fpu).addr() % 16, 0);
        assert_eq!(p.state(), ProcessState::Running);
    }
}
