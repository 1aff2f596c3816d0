use kernel_qemu::QemuLogger;
use log::{LevelFilter, SetLoggerError};

const LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};

static LOGGER: QemuLogger = QemuLogger::new(LEVEL);

/// Routes the `log` facade to QEMU's debug console. Call once, first thing.
///
/// Without the `qemu` feature records are formatted and discarded.
///
/// # Errors
/// If a logger is already installed.
pub fn init_logging() -> Result<(), SetLoggerError> {
    LOGGER.init()
}
