//! # Scheduler
//!
//! Round-robin over the [`ProcessTable`] in pid order. Every lifecycle
//! operation takes the table lock, edits process states, releases the lock
//! and then (if it gives up the CPU) calls [`Scheduler::schedule`].
//!
//! A process that has nothing to do is never left `Running`: `sleep`,
//! `waitpid` and [`Parker::block_current`] change its state first, so the
//! following `schedule` moves on even if nothing else is ready. With no
//! process ready at all the CPU idles until an interrupt makes one ready.

use crate::context::TrapFrame;
use crate::pid::{Pid, WaitTarget};
use crate::process::{Process, ProcessInfo, ProcessName, ProcessState};
use crate::stack::KernelStack;
use crate::table::ProcessTable;
use crate::{Arch, ForkError, SpawnError, WaitError};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::memory::{KERNEL_STACK_BASE, KERNEL_STACK_TOP};
use kernel_info::sched::{INITIAL_RFLAGS, MAX_PROCESSES, TIMER_FREQUENCY_HZ};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_sync::{IrqGuard, Parker, SpinLock};
use kernel_vmem::{AddressSpace, PageEntryBits, RootPage, VmaList, VmemError};

/// Outcome of one [`Scheduler::reap_or_block`] attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitStep {
    /// A zombie child was collected: its pid and exit status.
    Reaped(Pid, i32),
    /// Matching children exist but none has exited; the caller is now
    /// `Waiting` and should call [`Scheduler::schedule`].
    Blocked,
}

struct SchedState {
    table: ProcessTable,
    current: Pid,
    next_pid: u64,
    ticks: u64,
}

impl SchedState {
    fn running(&mut self) -> &mut Process {
        let pid = self.current;
        match self.table.get_mut(pid) {
            Some(p) => p,
            None => {
                log::error!("current process {pid} is missing from the table");
                panic!("current process {pid} not in the process table");
            }
        }
    }

    const fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn is_full(&self) -> bool {
        self.table.len() >= MAX_PROCESSES
    }

    /// Makes `pid` ready if it is in `waitpid` for something `child` satisfies.
    fn notify_waiter(&mut self, pid: Pid, child: Pid) {
        if let Some(p) = self.table.get_mut(pid)
            && let ProcessState::Waiting(target) = p.state
            && target.matches(child)
        {
            p.state = ProcessState::Ready;
        }
    }
}

/// What `schedule` decided under the lock.
enum Pick {
    Stay,
    Idle,
    Switch {
        prev_sp: *mut u64,
        next_sp: u64,
        next_root: Option<PhysicalFrame>,
    },
}

/// The process scheduler.
///
/// `F` is a copyable handle to a shared frame allocator (for example
/// `&SharedFrameAlloc`); stacks and address spaces of new and reaped
/// processes come from and go back to it.
pub struct Scheduler<'k, A: Arch, M: PhysMapper, F: FrameAlloc + Copy> {
    state: SpinLock<SchedState, A>,
    mapper: &'k M,
    frames: F,
    kernel_root: RootPage,
}

impl<'k, A: Arch, M: PhysMapper, F: FrameAlloc + Copy> Scheduler<'k, A, M, F> {
    /// Adopts the running boot context as pid 0 in `kernel_root`.
    pub fn new(mapper: &'k M, frames: F, kernel_root: RootPage) -> Self {
        let mut table = ProcessTable::new();
        table.insert(Box::new(Process::kernel()));
        log::info!("scheduler started in kernel space {kernel_root}");
        Self {
            state: SpinLock::new(SchedState {
                table,
                current: Pid::KERNEL,
                next_pid: 1,
                ticks: 0,
            }),
            mapper,
            frames,
            kernel_root,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    fn space(&self, root: RootPage) -> AddressSpace<'k, M, A> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// Pid of the running process.
    #[must_use]
    pub fn getpid(&self) -> Pid {
        self.state.lock().current
    }

    /// Timer ticks since start.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.state.lock().table.len()
    }

    #[must_use]
    pub fn find(&self, pid: Pid) -> Option<ProcessInfo> {
        self.state.lock().table.get(pid).map(Process::info)
    }

    /// Every process, in pid order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.state.lock().table.iter().map(Process::info).collect()
    }

    /// Runs `f` on the running process with the table locked.
    ///
    /// `f` must not call back into the scheduler.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Process) -> R) -> R {
        f(self.state.lock().running())
    }

    /// Like [`with_current`](Self::with_current) for any process.
    pub fn with_process<R>(&self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        self.state.lock().table.get_mut(pid).map(f)
    }

    /// Gives the CPU to the next ready process after the current one.
    ///
    /// Returns at once if nothing else is ready and the caller may keep
    /// running. Returns later, when switched back to, otherwise.
    ///
    /// # Panics
    /// If the outgoing process has overrun its kernel stack.
    pub fn schedule(&self) {
        let _irq = IrqGuard::<A>::new();
        loop {
            match self.pick() {
                Pick::Stay => return,
                Pick::Idle => A::idle(),
                Pick::Switch {
                    prev_sp,
                    next_sp,
                    next_root,
                } => {
                    // SAFETY: interrupts are off. `prev_sp` points into the
                    // boxed PCB of the outgoing process, which cannot be
                    // reaped before it has been switched away from.
                    unsafe { A::switch_context(prev_sp, next_sp, next_root) };
                    return;
                }
            }
        }
    }

    fn pick(&self) -> Pick {
        let mut st = self.state.lock();
        let prev = st.current;
        let Some(next) = st.table.next_ready_after(prev) else {
            let p = st.running();
            return match p.state {
                ProcessState::Running => Pick::Stay,
                ProcessState::Ready => {
                    p.state = ProcessState::Running;
                    Pick::Stay
                }
                _ => Pick::Idle,
            };
        };

        let mapper = self.mapper;
        let outgoing = st.running();
        if let Some(stack) = &outgoing.stack
            && !stack.guard_intact(mapper)
        {
            log::error!("kernel stack of {prev} ({}) overflowed", outgoing.name);
            panic!("kernel stack overflow in pid {prev}");
        }
        if outgoing.state == ProcessState::Running {
            outgoing.state = ProcessState::Ready;
        }
        // SAFETY: interrupts are off while the table is locked.
        unsafe { A::save_fpu(&mut outgoing.fpu) };
        let prev_sp = &raw mut outgoing.saved_sp;

        let Some(incoming) = st.table.get_mut(next) else {
            return Pick::Stay;
        };
        incoming.state = ProcessState::Running;
        // SAFETY: saved by `save_fpu` or freshly initialized.
        unsafe { A::restore_fpu(&incoming.fpu) };
        if let Some(stack) = &incoming.stack {
            let top = if incoming.address_space.is_some() {
                VirtualAddress::new(KERNEL_STACK_TOP)
            } else {
                stack.direct_top(mapper)
            };
            A::set_kernel_stack(top);
        }
        let root = incoming.address_space.unwrap_or(self.kernel_root);
        let next_sp = incoming.saved_sp;

        st.current = next;
        log::trace!("switch {prev} -> {next}");
        Pick::Switch {
            prev_sp,
            next_sp,
            next_root: (root != A::current_root()).then_some(root),
        }
    }

    /// Voluntarily gives up the CPU; the caller stays ready.
    #[inline]
    pub fn yield_now(&self) {
        self.schedule();
    }

    /// Timer interrupt: advances time, charges the running process, wakes
    /// due sleepers and preempts.
    pub fn on_timer_tick(&self) {
        {
            let mut st = self.state.lock();
            st.ticks += 1;
            let now = st.ticks;
            st.running().cpu_ticks += 1;
            let woken = st.table.wake_sleepers(now);
            if woken > 0 {
                log::trace!("tick {now}: {woken} sleeper(s) ready");
            }
        }
        self.schedule();
    }

    /// Sleeps for at least `ticks` timer ticks. Zero only yields.
    pub fn sleep(&self, ticks: u64) {
        if ticks > 0 {
            let mut st = self.state.lock();
            let until = st.ticks.saturating_add(ticks);
            st.running().state = ProcessState::Sleeping { until };
        }
        self.schedule();
    }

    /// Sleeps for at least `ms` milliseconds, rounded up to whole ticks.
    pub fn sleep_ms(&self, ms: u64) {
        let ticks = if ms == 0 {
            0
        } else {
            ms.saturating_mul(TIMER_FREQUENCY_HZ).div_ceil(1000).max(1)
        };
        self.sleep(ticks);
    }

    /// Ends the sleep of `pid` early. Returns whether it was sleeping.
    pub fn wake_sleeper(&self, pid: Pid) -> bool {
        let mut st = self.state.lock();
        match st.table.get_mut(pid) {
            Some(p) if matches!(p.state, ProcessState::Sleeping { .. }) => {
                p.state = ProcessState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Starts a kernel task at `entry` in the kernel address space.
    ///
    /// # Errors
    /// [`SpawnError`] if the table is full or no stack can be allocated.
    pub fn spawn(&self, entry: extern "C" fn() -> !, name: &str) -> Result<Pid, SpawnError> {
        let mut st = self.state.lock();
        if st.is_full() {
            log::warn!("cannot spawn {name}: process table full");
            return Err(SpawnError::ProcessTableFull);
        }
        let mut frames = self.frames;
        let stack = KernelStack::allocate(self.mapper, &mut frames)?;
        let top = stack.direct_top(self.mapper);
        let sp = stack.seed_entry(self.mapper, top, entry as usize as u64, INITIAL_RFLAGS);

        let parent = st.current;
        let pid = st.allocate_pid();
        st.table
            .insert(Box::new(Process::new(pid, parent, ProcessName::new(name), stack, sp)));
        log::debug!("spawned kernel task {pid} ({name})");
        Ok(pid)
    }

    /// Starts a user process in the prepared address space `root`, entering
    /// user mode with the registers of `entry`.
    ///
    /// The space is taken over; it is freed if the process cannot be created.
    ///
    /// # Errors
    /// [`SpawnError`] if the table is full or memory runs out.
    pub fn spawn_user(
        &self,
        name: &str,
        root: RootPage,
        vmas: VmaList,
        entry: &TrapFrame,
    ) -> Result<Pid, SpawnError> {
        let mut st = self.state.lock();
        let mut frames = self.frames;
        let space = self.space(root);
        if st.is_full() {
            log::warn!("cannot spawn {name}: process table full");
            space.free(&mut frames, self.kernel_root);
            return Err(SpawnError::ProcessTableFull);
        }
        let stack = match self.install_stack(&space) {
            Ok(stack) => stack,
            Err(e) => {
                log::warn!("cannot spawn {name}: {e}");
                space.free(&mut frames, self.kernel_root);
                return Err(e.into());
            }
        };
        let sp = stack.seed_trap_return(
            self.mapper,
            VirtualAddress::new(KERNEL_STACK_TOP),
            entry,
            A::trap_return_entry(),
        );

        let parent = st.current;
        let pid = st.allocate_pid();
        let mut p = Process::new(pid, parent, ProcessName::new(name), stack, sp);
        p.address_space = Some(root);
        p.vmas = vmas;
        st.table.insert(Box::new(p));
        log::debug!("spawned user process {pid} ({name}) in {root}");
        Ok(pid)
    }

    /// Allocates a kernel stack and maps it at the fixed window of `space`.
    ///
    /// The window mapping holds its own reference to each stack frame.
    fn install_stack(&self, space: &AddressSpace<'k, M, A>) -> Result<KernelStack, VmemError> {
        let mut frames = self.frames;
        let stack = KernelStack::allocate(self.mapper, &mut frames)?;
        let mut va = VirtualAddress::new(KERNEL_STACK_BASE);
        for frame in stack.frames() {
            if let Err(e) = space.map_page(&mut frames, va, frame, PageEntryBits::kernel_rw()) {
                stack.free(&mut frames);
                return Err(e);
            }
            frames.refcount_inc(frame);
            va = va + 4096;
        }
        Ok(stack)
    }

    /// Duplicates the running user process.
    ///
    /// The child shares every user page copy-on-write, gets a copy of the
    /// descriptor table, mapped areas and FPU state, and resumes from
    /// `frame` with `rax = 0`. Returns the child's pid to the parent.
    ///
    /// # Errors
    /// [`ForkError`]; nothing of the child remains.
    pub fn fork(&self, frame: &TrapFrame) -> Result<Pid, ForkError> {
        let (me, root) = {
            let mut st = self.state.lock();
            if st.is_full() {
                log::warn!("fork refused: process table full");
                return Err(ForkError::ProcessTableFull);
            }
            let parent = st.running();
            (parent.pid, parent.address_space.ok_or(ForkError::KernelTask)?)
        };

        // Only the parent itself changes its mappings, so the tables are
        // copied without holding the process table.
        let mut frames = self.frames;
        let child_space = self.space(root).clone_cow(&mut frames)?;
        let stack = match self.install_stack(&child_space) {
            Ok(stack) => stack,
            Err(e) => {
                log::warn!("fork of {me} failed: {e}");
                child_space.free(&mut frames, self.kernel_root);
                return Err(e.into());
            }
        };
        let sp = stack.seed_trap_return(
            self.mapper,
            VirtualAddress::new(KERNEL_STACK_TOP),
            &frame.for_child(),
            A::trap_return_entry(),
        );

        let mut st = self.state.lock();
        if st.is_full() {
            drop(st);
            log::warn!("fork refused: process table filled up");
            stack.free(&mut frames);
            child_space.free(&mut frames, self.kernel_root);
            return Err(ForkError::ProcessTableFull);
        }
        let parent = st.running();
        parent.vmas.mark_cow();
        let (name, files, vmas) = (parent.name, parent.files.clone(), parent.vmas.clone());
        let pid = st.allocate_pid();
        let mut child = Process::new(pid, me, name, stack, sp);
        child.address_space = Some(child_space.root());
        child.files = files;
        child.vmas = vmas;
        // SAFETY: interrupts are off; the live registers are the parent's.
        unsafe { A::save_fpu(&mut child.fpu) };
        st.table.insert(Box::new(child));
        log::debug!("fork {me} -> {pid}");
        Ok(pid)
    }

    /// Turns the running process into a zombie with `status` and schedules
    /// away. Its children go to pid 0. Resources are released when the
    /// parent reaps it.
    ///
    /// # Panics
    /// If called by pid 0.
    pub fn retire_current(&self, status: i32) {
        {
            let mut st = self.state.lock();
            let me = st.current;
            if me.is_kernel() {
                drop(st);
                log::error!("kernel process tried to exit with status {status}");
                panic!("the kernel process cannot exit");
            }
            let p = st.running();
            p.state = ProcessState::Zombie { status };
            let parent = p.parent;

            if st.table.reparent(me, Pid::KERNEL) {
                // Any orphaned zombie satisfies a `waitpid(-1)` of pid 0.
                if let Some(k) = st.table.get_mut(Pid::KERNEL)
                    && k.state == ProcessState::Waiting(WaitTarget::Any)
                {
                    k.state = ProcessState::Ready;
                }
            }
            st.notify_waiter(parent, me);
            log::debug!("{me} exited with status {status}");
        }
        self.schedule();
    }

    /// Terminates the running process.
    ///
    /// # Panics
    /// If called by pid 0, or if the zombie is ever scheduled again.
    pub fn exit(&self, status: i32) -> ! {
        self.retire_current(status);
        log::error!("exited process resumed as {}", self.getpid());
        panic!("zombie process was scheduled again");
    }

    /// One non-blocking step of `waitpid`.
    ///
    /// # Errors
    /// [`WaitError::NoChildren`] if no child matches `target`.
    pub fn reap_or_block(&self, target: WaitTarget) -> Result<WaitStep, WaitError> {
        let (zombie, status) = {
            let mut st = self.state.lock();
            let me = st.current;
            let Some((pid, status)) = st.table.zombie_child(me, target) else {
                if !st.table.has_child(me, target) {
                    return Err(WaitError::NoChildren);
                }
                st.running().state = ProcessState::Waiting(target);
                return Ok(WaitStep::Blocked);
            };
            (st.table.remove(pid).ok_or(WaitError::NoChildren)?, status)
        };
        let pid = zombie.pid;
        self.release(zombie);
        Ok(WaitStep::Reaped(pid, status))
    }

    /// Waits for a child matching `target` to exit and collects it.
    ///
    /// # Errors
    /// [`WaitError::NoChildren`] if no child matches `target`.
    pub fn waitpid(&self, target: WaitTarget) -> Result<(Pid, i32), WaitError> {
        loop {
            match self.reap_or_block(target)? {
                WaitStep::Reaped(pid, status) => return Ok((pid, status)),
                WaitStep::Blocked => self.schedule(),
            }
        }
    }

    /// Frees what a reaped zombie still holds.
    fn release(&self, zombie: Box<Process>) {
        let mut frames = self.frames;
        let Process {
            pid,
            stack,
            address_space,
            ..
        } = *zombie;
        if let Some(root) = address_space {
            self.space(root).free(&mut frames, self.kernel_root);
        }
        if let Some(stack) = stack {
            stack.free(&mut frames);
        }
        log::debug!("reaped {pid}");
    }
}

impl<A: Arch, M: PhysMapper, F: FrameAlloc + Copy> Parker for Scheduler<'_, A, M, F> {
    fn current_id(&self) -> Option<u64> {
        Some(self.getpid().as_u64())
    }

    fn block_current(&self) {
        self.state.lock().running().state = ProcessState::Blocked;
    }

    fn yield_now(&self) {
        self.schedule();
    }

    fn wake(&self, id: u64) {
        let mut st = self.state.lock();
        if let Some(p) = st.table.get_mut(Pid::new(id))
            && p.state == ProcessState::Blocked
        {
            p.state = ProcessState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FpuState, SwitchFrame};
    use crate::sim::SimArch;
    use kernel_alloc::sim::SimPhys;
    use kernel_alloc::{FrameAllocError, SharedFrameAlloc};
    use kernel_info::sched::STACK_GUARD_PATTERN;
    use kernel_sync::InterruptControl;
    use kernel_sync::sim::SimInterrupts;
    use kernel_vmem::{Mmu, VmaKind};
    use kernel_vmem::sim::SimMmu;
    use std::cell::Cell;

    type Frames = &'static SharedFrameAlloc<'static, SimInterrupts>;
    type Sched = Scheduler<'static, SimArch, SimPhys, Frames>;

    const DATA: u64 = 0x60_0000;

    extern "C" fn task() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn setup(frames: usize) -> (&'static SimPhys, Frames, Sched) {
        SimArch::reset();
        let ram = SimPhys::leaked(frames);
        let alloc = ram.shared_alloc();
        let kernel = { alloc }.alloc_frame().unwrap();
        ram.zero_frame(kernel);
        SimMmu::set_current_root(kernel);
        (ram, alloc, Scheduler::new(ram, alloc, kernel))
    }

    fn user_entry() -> TrapFrame {
        TrapFrame {
            rax: 57,
            rip: 0x40_1000,
            cs: 0x23,
            rflags: INITIAL_RFLAGS,
            rsp: 0x7fff_f000,
            ss: 0x1b,
            ..TrapFrame::default()
        }
    }

    /// A user process with one private data page.
    fn spawn_init<F: FrameAlloc + Copy>(
        s: &Scheduler<'static, SimArch, SimPhys, F>,
        ram: &'static SimPhys,
        alloc: F,
    ) -> Pid {
        let mut a = alloc;
        let space = AddressSpace::<SimPhys, SimArch>::create(ram, &mut a, s.kernel_root()).unwrap();
        let data = a.alloc_frame().unwrap();
        space
            .map_page(&mut a, VirtualAddress::new(DATA), data, PageEntryBits::user_rw())
            .unwrap();
        let mut vmas = VmaList::new();
        vmas.add(
            VirtualAddress::new(DATA),
            VirtualAddress::new(DATA + 4096),
            PageEntryBits::user_rw(),
            VmaKind::Data,
        )
        .unwrap();
        s.spawn_user("init", space.root(), vmas, &user_entry()).unwrap()
    }

    fn pids(s: &Sched) -> Vec<u64> {
        s.snapshot().iter().map(|p| p.pid.as_u64()).collect()
    }

    #[test]
    fn boot_context_is_pid_zero() {
        let (_, _, s) = setup(64);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert_eq!(s.process_count(), 1);
        let k = s.find(Pid::KERNEL).unwrap();
        assert_eq!(k.state, ProcessState::Running);
        assert_eq!(k.name.as_str(), "kernel");
        assert!(!k.user);
    }

    #[test]
    fn round_robin_in_pid_order() {
        let (_, _, s) = setup(64);
        for name in ["a", "b", "c"] {
            s.spawn(task, name).unwrap();
        }
        let order: Vec<u64> = (0..8)
            .map(|_| {
                s.schedule();
                s.getpid().as_u64()
            })
            .collect();
        assert_eq!(order, [1, 2, 3, 0, 1, 2, 3, 0]);
        assert_eq!(SimArch::switches().len(), 8);
        // the previous process is ready again, the new one running
        assert_eq!(s.find(Pid::new(3)).unwrap().state, ProcessState::Ready);
        assert_eq!(s.find(Pid::KERNEL).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn kernel_task_starts_at_its_entry() {
        let (ram, _, s) = setup(64);
        let pid = s.spawn(task, "worker").unwrap();
        s.with_process(pid, |p| {
            let stack = p.kernel_stack().unwrap();
            let top = stack.direct_top(ram).as_u64();
            assert_eq!(p.saved_sp(), top - 72);
            // SAFETY: seeded above.
            let frame: SwitchFrame = unsafe { stack.read_below_top(ram, 72) };
            assert_eq!(frame.rip, task as usize as u64);
            assert_eq!(frame.rflags, INITIAL_RFLAGS);
            assert_eq!(p.parent(), Pid::KERNEL);
        })
        .unwrap();

        s.schedule();
        assert_eq!(SimArch::switches(), [s.with_current(|p| p.saved_sp())]);
        // kernel tasks run on the direct-mapped stack in the kernel space
        let direct = s.with_current(|p| p.kernel_stack().unwrap().direct_top(ram).as_u64());
        assert_eq!(SimArch::rsp0(), direct);
        assert_eq!(SimMmu::loads(), 0);
    }

    #[test]
    fn lone_process_keeps_running() {
        let (_, _, s) = setup(64);
        s.yield_now();
        s.sleep(0);
        s.sleep_ms(0);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert!(SimArch::switches().is_empty());
        assert_eq!(s.find(Pid::KERNEL).unwrap().state, ProcessState::Running);
    }

    #[test]
    fn sleep_zero_yields_without_sleeping() {
        let (_, _, s) = setup(64);
        s.spawn(task, "a").unwrap();
        s.sleep(0);
        assert_eq!(s.getpid(), Pid::new(1));
        assert_eq!(s.find(Pid::KERNEL).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn sleeper_wakes_on_its_tick() {
        let (_, _, s) = setup(64);
        let a = s.spawn(task, "a").unwrap();
        s.schedule();
        s.sleep(3);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert_eq!(s.find(a).unwrap().state, ProcessState::Sleeping { until: 3 });

        s.on_timer_tick();
        s.on_timer_tick();
        assert_eq!(s.getpid(), Pid::KERNEL);
        s.on_timer_tick();
        assert_eq!(s.getpid(), a);
        assert_eq!(s.ticks(), 3);
        assert_eq!(s.find(Pid::KERNEL).unwrap().cpu_ticks, 3);
    }

    #[test]
    fn sleep_ms_rounds_up_to_ticks() {
        let (_, _, s) = setup(64);
        let a = s.spawn(task, "a").unwrap();
        s.schedule();
        s.sleep_ms(5);
        let until = (5 * TIMER_FREQUENCY_HZ).div_ceil(1000);
        assert_eq!(s.find(a).unwrap().state, ProcessState::Sleeping { until });
    }

    #[test]
    fn early_wake_only_hits_sleepers() {
        let (_, _, s) = setup(64);
        let a = s.spawn(task, "a").unwrap();
        s.schedule();
        s.sleep(50);
        assert!(s.wake_sleeper(a));
        assert_eq!(s.find(a).unwrap().state, ProcessState::Ready);
        assert!(!s.wake_sleeper(a));
        assert!(!s.wake_sleeper(Pid::new(99)));
    }

    #[test]
    fn parked_process_is_skipped_until_woken() {
        let (_, _, s) = setup(64);
        for name in ["a", "b", "c"] {
            s.spawn(task, name).unwrap();
        }
        s.schedule();
        assert_eq!(Parker::current_id(&s), Some(1));
        Parker::block_current(&s);
        Parker::yield_now(&s);
        assert_eq!(s.getpid(), Pid::new(2));
        assert_eq!(s.find(Pid::new(1)).unwrap().state, ProcessState::Blocked);

        let skipped: Vec<u64> = (0..3)
            .map(|_| {
                s.schedule();
                s.getpid().as_u64()
            })
            .collect();
        assert_eq!(skipped, [3, 0, 2]);

        // waking something that is not blocked changes nothing
        Parker::wake(&s, 3);
        assert_eq!(s.find(Pid::new(3)).unwrap().state, ProcessState::Ready);
        Parker::wake(&s, 1);
        let resumed: Vec<u64> = (0..3)
            .map(|_| {
                s.schedule();
                s.getpid().as_u64()
            })
            .collect();
        assert_eq!(resumed, [3, 0, 1]);
    }

    #[test]
    #[should_panic(expected = "idle with no runnable process")]
    fn nothing_runnable_idles() {
        let (_, _, s) = setup(64);
        Parker::block_current(&s);
        s.schedule();
    }

    #[test]
    #[should_panic(expected = "kernel stack overflow in pid 1")]
    fn clobbered_guard_is_fatal_on_switch() {
        let (ram, _, s) = setup(64);
        s.spawn(task, "a").unwrap();
        s.schedule();
        s.with_current(|p| {
            let base = p.kernel_stack().unwrap().base();
            // SAFETY: the guard words at the stack base.
            unsafe { *ram.phys_to_mut::<u64>(base.base()) = !STACK_GUARD_PATTERN };
        });
        s.schedule();
    }

    #[test]
    fn interrupt_state_survives_a_switch() {
        let (_, _, s) = setup(64);
        s.spawn(task, "a").unwrap();
        s.schedule();
        assert!(SimInterrupts::are_enabled());
        SimInterrupts::disable();
        s.schedule();
        assert!(!SimInterrupts::are_enabled());
        SimInterrupts::enable();
    }

    #[test]
    fn fpu_state_follows_its_process() {
        let (_, _, s) = setup(64);
        s.spawn(task, "a").unwrap();
        let mut mine = FpuState::new();
        mine.0[100] = 0xaa;
        SimArch::set_live_fpu(mine);

        s.schedule();
        assert_eq!(SimArch::live_fpu(), FpuState::new());
        let mut theirs = FpuState::new();
        theirs.0[100] = 0xbb;
        SimArch::set_live_fpu(theirs);

        s.schedule();
        assert_eq!(SimArch::live_fpu().0[100], 0xaa);
        s.schedule();
        assert_eq!(SimArch::live_fpu().0[100], 0xbb);
    }

    #[test]
    fn fork_exit_reap_round_trip() {
        let (ram, alloc, s) = setup(256);
        let init = spawn_init(&s, ram, alloc);
        s.schedule();
        assert_eq!(s.getpid(), init);
        assert_eq!(SimArch::rsp0(), KERNEL_STACK_TOP);
        let init_root = s.with_current(|p| p.address_space()).unwrap();
        assert_eq!(SimMmu::current_root(), init_root);

        let free = alloc.free_frames_count();
        s.with_current(|p| p.files_mut().install(crate::FileHandle(9)));
        let mut fpu = FpuState::new();
        fpu.0[200] = 0x5a;
        SimArch::set_live_fpu(fpu);

        let child = s.fork(&user_entry()).unwrap();
        assert_eq!(child, Pid::new(2));
        let info = s.find(child).unwrap();
        assert_eq!(info.parent, init);
        assert_eq!(info.state, ProcessState::Ready);
        assert_eq!(info.name.as_str(), "init");
        assert!(info.user);
        assert!(s.with_current(|p| p.vmas().iter().all(|v| v.cow)));

        s.with_process(child, |p| {
            let stack = p.kernel_stack().unwrap();
            let root = p.address_space().unwrap();
            assert_ne!(root, init_root);
            let space = AddressSpace::<SimPhys, SimArch>::from_root(ram, root);
            assert_eq!(
                space.translate(VirtualAddress::new(KERNEL_STACK_BASE)),
                Some(stack.base().base())
            );
            assert_eq!(
                space.translate(VirtualAddress::new(DATA)),
                AddressSpace::<SimPhys, SimArch>::from_root(ram, init_root).translate(VirtualAddress::new(DATA))
            );
            assert_eq!(p.saved_sp(), KERNEL_STACK_TOP - 224);
            // SAFETY: seeded by fork.
            let trap: TrapFrame = unsafe { stack.read_below_top(ram, 160) };
            assert_eq!(trap.rax, 0);
            assert_eq!(trap.rip, 0x40_1000);
            // SAFETY: seeded by fork.
            let sw: SwitchFrame = unsafe { stack.read_below_top(ram, 224) };
            assert_eq!(sw.rip, SimArch::TRAP_RETURN);
            assert_eq!(p.files().get(0), Some(crate::FileHandle(9)));
            assert_eq!(p.vmas().len(), 1);
            assert_eq!(p.fpu.0[200], 0x5a);
        })
        .unwrap();

        s.schedule();
        assert_eq!(s.getpid(), child);
        s.retire_current(7);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert_eq!(s.find(child).unwrap().state, ProcessState::Zombie { status: 7 });

        s.schedule();
        assert_eq!(s.getpid(), init);
        assert_eq!(s.waitpid(WaitTarget::Any), Ok((child, 7)));
        assert!(s.find(child).is_none());
        assert_eq!(alloc.free_frames_count(), free);
    }

    #[test]
    fn waiting_parent_is_woken_by_exit() {
        let (_, _, s) = setup(64);
        let a = s.spawn(task, "a").unwrap();
        assert_eq!(s.reap_or_block(WaitTarget::Pid(Pid::new(5))), Err(WaitError::NoChildren));
        assert_eq!(s.reap_or_block(WaitTarget::Any), Ok(WaitStep::Blocked));
        assert_eq!(s.find(Pid::KERNEL).unwrap().state, ProcessState::Waiting(WaitTarget::Any));

        s.schedule();
        assert_eq!(s.getpid(), a);
        s.retire_current(3);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert_eq!(s.reap_or_block(WaitTarget::Pid(a)), Ok(WaitStep::Reaped(a, 3)));
        assert_eq!(s.waitpid(WaitTarget::Any), Err(WaitError::NoChildren));
    }

    #[test]
    fn waiter_for_one_pid_ignores_its_siblings() {
        let (_, _, s) = setup(64);
        let a = s.spawn(task, "a").unwrap();
        let b = s.spawn(task, "b").unwrap();
        assert_eq!(s.reap_or_block(WaitTarget::Pid(b)), Ok(WaitStep::Blocked));

        s.schedule();
        assert_eq!(s.getpid(), a);
        s.retire_current(1);
        assert_eq!(s.getpid(), b, "pid 0 is still waiting");
        assert_eq!(s.find(Pid::KERNEL).unwrap().state, ProcessState::Waiting(WaitTarget::Pid(b)));

        s.retire_current(2);
        assert_eq!(s.getpid(), Pid::KERNEL);
        assert_eq!(s.reap_or_block(WaitTarget::Pid(b)), Ok(WaitStep::Reaped(b, 2)));
        assert_eq!(s.find(a).unwrap().state, ProcessState::Zombie { status: 1 });
        assert_eq!(s.waitpid(WaitTarget::Any), Ok((a, 1)));
    }

    #[test]
    fn orphans_are_adopted_by_pid_zero() {
        let (ram, alloc, s) = setup(256);
        let init = spawn_init(&s, ram, alloc);
        s.schedule();
        let child = s.fork(&user_entry()).unwrap();

        s.retire_current(0);
        assert_eq!(s.find(child).unwrap().parent, Pid::KERNEL);
        assert_eq!(s.getpid(), child);
        s.retire_current(5);
        assert_eq!(s.getpid(), Pid::KERNEL);

        assert_eq!(s.waitpid(WaitTarget::Any), Ok((init, 0)));
        assert_eq!(s.waitpid(WaitTarget::Any), Ok((child, 5)));
        assert_eq!(pids(&s), [0]);
    }

    #[test]
    fn reaping_the_newest_keeps_the_rotation() {
        let (ram, alloc, s) = setup(256);
        let init = spawn_init(&s, ram, alloc);
        s.schedule();
        for _ in 0..3 {
            s.fork(&user_entry()).unwrap();
        }
        assert_eq!(pids(&s), [0, 1, 2, 3, 4]);
        for expected in [2, 3, 4] {
            s.schedule();
            assert_eq!(s.getpid().as_u64(), expected);
        }
        s.retire_current(44);
        assert_eq!(s.getpid(), Pid::KERNEL);
        s.schedule();
        assert_eq!(s.getpid(), init);
        assert_eq!(s.waitpid(WaitTarget::Pid(Pid::new(4))), Ok((Pid::new(4), 44)));
        assert_eq!(pids(&s), [0, 1, 2, 3]);

        let order: Vec<u64> = (0..4)
            .map(|_| {
                s.schedule();
                s.getpid().as_u64()
            })
            .collect();
        assert_eq!(order, [2, 3, 0, 1]);
        // pids are not reused
        assert_eq!(s.fork(&user_entry()), Ok(Pid::new(5)));
    }

    #[test]
    fn fork_needs_a_user_process() {
        let (_, _, s) = setup(64);
        assert_eq!(s.fork(&user_entry()), Err(ForkError::KernelTask));
    }

    #[test]
    fn fork_out_of_memory_leaves_nothing_behind() {
        // kernel root + init (root, data, 3 tables, 4 stack, 3 tables) = 13,
        // leaving 6: the clone fits, the child's stack does not.
        let (ram, alloc, s) = setup(20);
        let init = spawn_init(&s, ram, alloc);
        s.schedule();
        let free = alloc.free_frames_count();
        assert_eq!(free, 6);

        assert_eq!(s.fork(&user_entry()), Err(ForkError::OutOfMemory));
        assert_eq!(alloc.free_frames_count(), free);
        assert_eq!(pids(&s), [0, init.as_u64()]);
        let data = s
            .with_current(|p| AddressSpace::<SimPhys, SimArch>::from_root(ram, p.address_space().unwrap()))
            .translate(VirtualAddress::new(DATA))
            .unwrap();
        assert_eq!({ alloc }.refcount(PhysicalFrame::containing(data)), 1);
    }

    std::thread_local! {
        static MASKED_ALLOCS: Cell<usize> = const { Cell::new(0) };
    }

    /// Frame handle that counts allocations made with interrupts masked.
    #[derive(Copy, Clone)]
    struct Watched(Frames);

    impl Watched {
        fn note() {
            if !SimInterrupts::are_enabled() {
                MASKED_ALLOCS.with(|c| c.set(c.get() + 1));
            }
        }
    }

    impl FrameAlloc for Watched {
        fn alloc_frame(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
            Self::note();
            self.0.alloc_frame()
        }

        fn alloc_frames(&mut self, count: usize) -> Result<PhysicalFrame, FrameAllocError> {
            Self::note();
            self.0.alloc_frames(count)
        }

        fn refcount_inc(&mut self, frame: PhysicalFrame) {
            self.0.refcount_inc(frame);
        }

        fn refcount_dec(&mut self, frame: PhysicalFrame) {
            self.0.refcount_dec(frame);
        }

        fn refcount(&self, frame: PhysicalFrame) -> u16 {
            self.0.refcount(frame)
        }
    }

    #[test]
    fn fork_copies_tables_with_interrupts_enabled() {
        SimArch::reset();
        let ram = SimPhys::leaked(256);
        let alloc = Watched(ram.shared_alloc());
        let kernel = { alloc }.alloc_frame().unwrap();
        ram.zero_frame(kernel);
        SimMmu::set_current_root(kernel);
        let s = Scheduler::<SimArch, SimPhys, Watched>::new(ram, alloc, kernel);
        let init = spawn_init(&s, ram, alloc);
        s.schedule();
        assert_eq!(s.getpid(), init);

        MASKED_ALLOCS.with(|c| c.set(0));
        let child = s.fork(&user_entry()).unwrap();
        assert_eq!(MASKED_ALLOCS.with(Cell::get), 0);
        assert!(s.find(child).is_some());
        assert!(SimInterrupts::are_enabled());
    }

    #[test]
    fn process_table_has_a_limit() {
        let (_, _, s) = setup(MAX_PROCESSES * 4 + 64);
        for _ in 1..MAX_PROCESSES {
            s.spawn(task, "t").unwrap();
        }
        assert_eq!(s.process_count(), MAX_PROCESSES);
        assert_eq!(s.spawn(task, "t"), Err(SpawnError::ProcessTableFull));
        assert_eq!(s.fork(&user_entry()), Err(ForkError::ProcessTableFull));
    }

    #[test]
    fn failed_user_spawn_frees_the_space() {
        let (ram, alloc, s) = setup(MAX_PROCESSES * 4 + 64);
        for _ in 1..MAX_PROCESSES {
            s.spawn(task, "t").unwrap();
        }
        let free = alloc.free_frames_count();
        let mut a = alloc;
        let space = AddressSpace::<SimPhys, SimArch>::create(ram, &mut a, s.kernel_root()).unwrap();
        assert_eq!(
            s.spawn_user("late", space.root(), VmaList::new(), &user_entry()),
            Err(SpawnError::ProcessTableFull)
        );
        assert_eq!(alloc.free_frames_count(), free);
    }

    #[test]
    #[should_panic(expected = "the kernel process cannot exit")]
    fn pid_zero_cannot_exit() {
        let (_, _, s) = setup(64);
        s.exit(1);
    }
}
