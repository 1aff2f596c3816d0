use crate::InterruptControl;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Interrupt-safe spinlock.
///
/// Acquiring masks interrupts *before* spinning and remembers whether they
/// were enabled; releasing clears the lock word first and then restores
/// exactly that state. A handler that interrupts the holder therefore cannot
/// spin on the same lock forever, and a lock taken with interrupts already
/// masked never turns them back on.
///
/// Never hold one across a voluntary context switch.
pub struct SpinLock<T, I: InterruptControl> {
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// Interrupt state of the current holder at acquisition.
    /// Only meaningful while `locked` is set.
    irq_were_enabled: AtomicBool,
    inner: UnsafeCell<T>,
    _irq: PhantomData<fn() -> I>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send, I: InterruptControl> Sync for SpinLock<T, I> {}
unsafe impl<T: Send, I: InterruptControl> Send for SpinLock<T, I> {}

impl<T, I: InterruptControl> SpinLock<T, I> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            irq_were_enabled: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
            _irq: PhantomData,
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Try once; returns immediately. Interrupts are left as they were on failure.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, I>> {
        let were_enabled = I::save_and_disable();
        if self.try_acquire() {
            self.irq_were_enabled.store(were_enabled, Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            I::restore(were_enabled);
            None
        }
    }

    /// Mask interrupts, spin until acquired (TATAS), then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T, I> {
        let were_enabled = I::save_and_disable();
        while !self.try_acquire() {
            // Spin on a plain read until the word looks free, then retry the CAS.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        self.irq_were_enabled.store(were_enabled, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Whether the lock is currently held by anyone.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default, I: InterruptControl> Default for SpinLock<T, I> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SpinLockGuard<'a, T, I: InterruptControl> {
    lock: &'a SpinLock<T, I>,
}

impl<T, I: InterruptControl> Deref for SpinLockGuard<'_, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T, I: InterruptControl> DerefMut for SpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T, I: InterruptControl> Drop for SpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        let were_enabled = self.lock.irq_were_enabled.load(Ordering::Relaxed);
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
        I::restore(were_enabled);
    }
}
