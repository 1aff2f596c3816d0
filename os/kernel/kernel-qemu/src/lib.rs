//! # Kernel Log Output
//!
//! A [`log::Log`] implementation for kernels, plus a raw trace macro.
//!
//! ## Pieces
//!
//! * [`KernelLogger<W>`]: formats each record as `[LEVEL] target: message`
//!   into a fresh `W`. `W` is any [`core::fmt::Write`] that can be created
//!   on demand (`Default`), so the logger needs no allocation and no
//!   mutable global.
//! * [`qemu_fmt::QemuSink`]: writes to QEMU's debug console, I/O port
//!   `0x402`. [`QemuLogger`] is the logger over it.
//! * [`qemu_trace!`]: `format!`-style output straight to the debug port,
//!   bypassing `log`.
//!
//! ```text
//! log::info!(…) ─► KernelLogger<QemuSink> ─┐
//!                                           ├─► QemuSink ─► out 0x402 ─► -debugcon
//! qemu_trace!(…) ───────────────────────────┘
//! ```
//!
//! ## `enabled` feature (default)
//!
//! Without it, `QemuSink` discards everything and `qemu_trace!` compiles to
//! nothing observable; no port I/O is emitted.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger installed once");
//! log::info!("frame allocator up");
//! ```
//!
//! On the host side: `qemu-system-x86_64 … -debugcon stdio`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::KernelLogger;

/// [`KernelLogger`] writing to QEMU's debug console.
pub type QemuLogger = KernelLogger<qemu_fmt::QemuSink>;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port (`-debugcon`).
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: port 0x402 has no side effects beyond the debug console.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = (QEMU_DEBUG_PORT, c);
    }

    /// Byte-at-a-time writer to the debug port.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the sink itself never fails.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    /// Discards everything.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct QemuSink;

    impl fmt::Write for QemuSink {
        #[inline]
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// `format!`-style raw output to the debug console. No newline is added.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
