use kernel_sync::{InterruptControl, Parker, SleepMutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

thread_local! {
    static IF: Cell<bool> = const { Cell::new(true) };
    static ID: Cell<Option<u64>> = const { Cell::new(None) };
}

struct TestIrq;

impl InterruptControl for TestIrq {
    fn are_enabled() -> bool {
        IF.with(Cell::get)
    }
    fn disable() {
        IF.with(|f| f.set(false));
    }
    fn enable() {
        IF.with(|f| f.set(true));
    }
}

/// Threads play processes: each registers an id, and a blocked thread does
/// not return from `yield_now` until somebody wakes it.
#[derive(Default)]
struct ThreadParker {
    blocked: Mutex<Vec<u64>>,
    blocks: AtomicUsize,
    wakes: AtomicUsize,
}

impl ThreadParker {
    fn enter(id: u64) {
        ID.with(|c| c.set(Some(id)));
    }
}

impl Parker for ThreadParker {
    fn current_id(&self) -> Option<u64> {
        ID.with(Cell::get)
    }

    fn block_current(&self) {
        // the queue spinlock is held here
        assert!(!TestIrq::are_enabled());
        if let Some(id) = self.current_id() {
            self.blocked.lock().unwrap().push(id);
        }
        self.blocks.fetch_add(1, Ordering::SeqCst);
    }

    fn yield_now(&self) {
        let Some(me) = self.current_id() else {
            return;
        };
        while self.blocked.lock().unwrap().contains(&me) {
            thread::yield_now();
        }
    }

    fn wake(&self, id: u64) {
        self.blocked.lock().unwrap().retain(|b| *b != id);
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

type Mtx<T> = SleepMutex<T, TestIrq>;

#[test]
fn uncontended_lock_records_owner() {
    let parker = ThreadParker::default();
    ThreadParker::enter(7);

    let m = Mtx::new(5);
    {
        let mut g = m.lock(&parker);
        *g += 1;
        assert_eq!(m.owner(), Some(7));
    }
    assert_eq!(m.owner(), None);
    assert!(!m.is_locked());
    assert_eq!(*m.lock(&parker), 6);
    assert_eq!(parker.blocks.load(Ordering::SeqCst), 0);
}

#[test]
fn try_lock_fails_while_held() {
    let parker = ThreadParker::default();
    ThreadParker::enter(1);

    let m = Mtx::new(());
    let g = m.try_lock(&parker);
    assert!(g.is_some());
    assert!(m.try_lock(&parker).is_none());
    drop(g);
    assert!(m.try_lock(&parker).is_some());
}

#[test]
fn spins_when_no_process_context_exists() {
    let parker = ThreadParker::default();
    ID.with(|c| c.set(None));

    let m = Mtx::new(0);
    *m.lock(&parker) += 1;
    assert_eq!(m.owner(), None);
    assert_eq!(m.waiter_count(), 0);
}

#[test]
fn contenders_block_and_every_release_wakes_one() {
    let threads = 6;
    let iters = 500;

    let parker = Arc::new(ThreadParker::default());
    let m = Arc::new(Mtx::new(0u64));
    let inside = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let parker = Arc::clone(&parker);
            let m = Arc::clone(&m);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                ThreadParker::enter(i as u64 + 1);
                start.wait();
                for _ in 0..iters {
                    let mut g = m.lock(&*parker);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    *g += 1;
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*m.lock(&*parker), (threads * iters) as u64);
    assert_eq!(m.waiter_count(), 0);
    // each blocked contender was queued once and popped by exactly one release
    assert_eq!(
        parker.blocks.load(Ordering::SeqCst),
        parker.wakes.load(Ordering::SeqCst)
    );
    assert!(parker.blocked.lock().unwrap().is_empty());
}
