//! # Process Table
//!
//! Owns every process control block, keyed by pid. Iteration is in pid
//! order, which is also the round-robin order.

use crate::pid::{Pid, WaitTarget};
use crate::process::{Process, ProcessState};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

#[derive(Debug, Default)]
pub struct ProcessTable {
    procs: BTreeMap<Pid, Box<Process>>,
}

impl ProcessTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid).map(AsRef::as_ref)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid).map(AsMut::as_mut)
    }

    /// Adds a process.
    ///
    /// # Panics
    /// If the pid is taken; pids are never reused.
    pub fn insert(&mut self, process: Box<Process>) {
        let pid = process.pid;
        if self.procs.insert(pid, process).is_some() {
            log::error!("pid {pid} inserted twice");
            panic!("duplicate pid {pid}");
        }
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        self.procs.remove(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.values().map(AsRef::as_ref)
    }

    /// The first `Ready` process after `after` in pid order, wrapping
    /// around. `after` itself is not considered.
    #[must_use]
    pub fn next_ready_after(&self, after: Pid) -> Option<Pid> {
        self.procs
            .range((Excluded(after), Unbounded))
            .chain(self.procs.range(..after))
            .find(|(_, p)| p.state == ProcessState::Ready)
            .map(|(pid, _)| *pid)
    }

    pub fn children(&self, parent: Pid) -> impl Iterator<Item = &Process> {
        self.iter().filter(move |p| p.parent == parent && p.pid != parent)
    }

    /// Whether `parent` has a child matching `target`, alive or not.
    #[must_use]
    pub fn has_child(&self, parent: Pid, target: WaitTarget) -> bool {
        self.children(parent).any(|p| target.matches(p.pid))
    }

    /// The lowest-pid zombie child of `parent` matching `target`, with its
    /// exit status.
    #[must_use]
    pub fn zombie_child(&self, parent: Pid, target: WaitTarget) -> Option<(Pid, i32)> {
        self.children(parent).find_map(|p| match p.state {
            ProcessState::Zombie { status } if target.matches(p.pid) => Some((p.pid, status)),
            _ => None,
        })
    }

    /// Hands every child of `from` to `to`. Returns whether any of them is
    /// already a zombie.
    pub fn reparent(&mut self, from: Pid, to: Pid) -> bool {
        let mut zombie = false;
        for p in self.procs.values_mut().filter(|p| p.parent == from && p.pid != from) {
            p.parent = to;
            zombie |= p.state.is_zombie();
        }
        zombie
    }

    /// Makes sleepers whose deadline has passed ready. Returns how many.
    pub fn wake_sleepers(&mut self, now: u64) -> usize {
        let mut woken = 0;
        for p in self.procs.values_mut() {
            if let ProcessState::Sleeping { until } = p.state
                && until <= now
            {
                p.state = ProcessState::Ready;
                woken += 1;
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessName;
    use crate::stack::KernelStack;
    use kernel_alloc::BitmapFrameAlloc;
    use kernel_alloc::sim::SimPhys;

    fn table(pids: &[u64]) -> ProcessTable {
        let ram = SimPhys::leaked(64);
        let words = vec![0u64; 1].leak();
        let counts = vec![0u16; 64].leak();
        let mut alloc = BitmapFrameAlloc::new(&ram.memory_map(), words, counts).unwrap();

        let mut t = ProcessTable::new();
        t.insert(Box::new(Process::kernel()));
        for &n in pids {
            let stack = KernelStack::allocate(ram, &mut alloc).unwrap();
            let p = Process::new(Pid::new(n), Pid::KERNEL, ProcessName::new("t"), stack, 0);
            t.insert(Box::new(p));
        }
        t
    }

    fn set(t: &mut ProcessTable, pid: u64, state: ProcessState) {
        t.get_mut(Pid::new(pid)).unwrap().state = state;
    }

    #[test]
    fn round_robin_wraps_and_skips_blocked() {
        let mut t = table(&[1, 2, 3]);
        assert_eq!(t.next_ready_after(Pid::new(1)), Some(Pid::new(2)));
        set(&mut t, 2, ProcessState::Blocked);
        assert_eq!(t.next_ready_after(Pid::new(1)), Some(Pid::new(3)));
        assert_eq!(t.next_ready_after(Pid::new(3)), Some(Pid::new(1)));
        set(&mut t, 1, ProcessState::Sleeping { until: 10 });
        set(&mut t, 3, ProcessState::Running);
        // the kernel process is Running, so nothing is ready
        assert_eq!(t.next_ready_after(Pid::new(3)), None);
    }

    #[test]
    fn zombies_and_reparenting() {
        let mut t = table(&[1, 2, 3]);
        t.get_mut(Pid::new(2)).unwrap().parent = Pid::new(1);
        t.get_mut(Pid::new(3)).unwrap().parent = Pid::new(1);
        set(&mut t, 3, ProcessState::Zombie { status: 4 });

        assert!(t.has_child(Pid::new(1), WaitTarget::Any));
        assert!(!t.has_child(Pid::new(1), WaitTarget::Pid(Pid::new(7))));
        assert_eq!(t.zombie_child(Pid::new(1), WaitTarget::Any), Some((Pid::new(3), 4)));
        assert_eq!(t.zombie_child(Pid::new(1), WaitTarget::Pid(Pid::new(2))), None);

        assert!(t.reparent(Pid::new(1), Pid::KERNEL));
        assert!(!t.has_child(Pid::new(1), WaitTarget::Any));
        // the kernel process is its own parent but not its own child
        assert_eq!(t.children(Pid::KERNEL).count(), 3);
    }

    #[test]
    fn sleepers_wake_at_their_deadline() {
        let mut t = table(&[1, 2]);
        set(&mut t, 1, ProcessState::Sleeping { until: 5 });
        set(&mut t, 2, ProcessState::Sleeping { until: 6 });
        assert_eq!(t.wake_sleepers(4), 0);
        assert_eq!(t.wake_sleepers(5), 1);
        assert_eq!(t.get(Pid::new(1)).unwrap().state, ProcessState::Ready);
        assert_eq!(t.get(Pid::new(2)).unwrap().state, ProcessState::Sleeping { until: 6 });
    }

    #[test]
    #[should_panic(expected = "duplicate pid")]
    fn pids_are_unique() {
        let mut t = table(&[]);
        t.insert(Box::new(Process::kernel()));
    }
}
