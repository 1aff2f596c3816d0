//! Sleeping mutex layered on the scheduler.

use crate::{InterruptControl, SpinLock};
use alloc::collections::VecDeque;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Scheduler services a [`SleepMutex`] needs to put a contender to sleep.
///
/// Ids are opaque to the mutex; the scheduler uses process ids.
pub trait Parker {
    /// Id of the running process, or `None` before scheduling has started.
    fn current_id(&self) -> Option<u64>;

    /// Marks the running process blocked. Called with the mutex's wait queue
    /// locked, so a concurrent release cannot slip between the enqueue and
    /// the state change.
    fn block_current(&self);

    /// Gives up the CPU; returns once the caller is scheduled again.
    fn yield_now(&self);

    /// Makes `id` runnable if it is blocked. A no-op otherwise.
    fn wake(&self, id: u64);
}

const NO_OWNER: u64 = u64::MAX;

/// Mutual exclusion for longer critical sections.
///
/// A contended acquirer enqueues itself, becomes blocked, and yields instead
/// of spinning; each release wakes the longest waiter, which then competes
/// for the lock again. Before any process exists (no current id), acquirers
/// fall back to spinning.
///
/// Never acquire from an interrupt handler.
pub struct SleepMutex<T, I: InterruptControl> {
    locked: AtomicBool,
    owner: AtomicU64,
    waiters: SpinLock<VecDeque<u64>, I>,
    value: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send, I: InterruptControl> Sync for SleepMutex<T, I> {}
unsafe impl<T: Send, I: InterruptControl> Send for SleepMutex<T, I> {}

impl<T, I: InterruptControl> SleepMutex<T, I> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            waiters: SpinLock::new(VecDeque::new()),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn try_acquire<P: Parker>(&self, parker: &P) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner
                .store(parker.current_id().unwrap_or(NO_OWNER), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Acquires without blocking.
    pub fn try_lock<'a, P: Parker>(&'a self, parker: &'a P) -> Option<SleepMutexGuard<'a, T, I, P>> {
        if self.try_acquire(parker) {
            Some(SleepMutexGuard { mutex: self, parker })
        } else {
            None
        }
    }

    /// Acquires, sleeping while another process holds the lock.
    pub fn lock<'a, P: Parker>(&'a self, parker: &'a P) -> SleepMutexGuard<'a, T, I, P> {
        loop {
            if self.try_acquire(parker) {
                break;
            }

            let Some(id) = parker.current_id() else {
                spin_loop();
                continue;
            };

            let mut queue = self.waiters.lock();
            // Re-check under the queue lock: a release that happened after the
            // failed attempt above found the queue empty and woke nobody.
            if self.try_acquire(parker) {
                break;
            }
            queue.push_back(id);
            parker.block_current();
            drop(queue);
            parker.yield_now();
        }
        SleepMutexGuard { mutex: self, parker }
    }

    /// Id recorded by the current holder, if held by a process.
    pub fn owner(&self) -> Option<u64> {
        if !self.locked.load(Ordering::Relaxed) {
            return None;
        }
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Number of processes queued for the lock.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock<P: Parker>(&self, parker: &P) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);

        let next = self.waiters.lock().pop_front();
        if let Some(id) = next {
            parker.wake(id);
        }
    }
}

pub struct SleepMutexGuard<'a, T, I: InterruptControl, P: Parker> {
    mutex: &'a SleepMutex<T, I>,
    parker: &'a P,
}

impl<T, I: InterruptControl, P: Parker> Deref for SleepMutexGuard<'_, T, I, P> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, I: InterruptControl, P: Parker> DerefMut for SleepMutexGuard<'_, T, I, P> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T, I: InterruptControl, P: Parker> Drop for SleepMutexGuard<'_, T, I, P> {
    fn drop(&mut self) {
        self.mutex.unlock(self.parker);
    }
}
