//! Host-side stand-ins for running the lock types under `cargo test`.

extern crate std;

use crate::InterruptControl;
use core::cell::Cell;

std::thread_local! {
    static IF: Cell<bool> = const { Cell::new(true) };
}

/// Per-thread simulated interrupt-enable flag. Starts enabled.
pub struct SimInterrupts;

impl InterruptControl for SimInterrupts {
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
