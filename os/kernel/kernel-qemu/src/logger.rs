use core::fmt::{self, Write};
use core::marker::PhantomData;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Logs every record at or below `max_level` to a fresh `W`.
pub struct KernelLogger<W> {
    max_level: LevelFilter,
    _sink: PhantomData<fn() -> W>,
}

impl<W: Write + Default> KernelLogger<W> {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            _sink: PhantomData,
        }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Installs this logger as the global `log` sink. Call once, early.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    /// `[LEVEL] target: message` plus newline.
    fn write_record(sink: &mut W, record: &Record) -> fmt::Result {
        writeln!(sink, "[{:<5}] {}: {}", record.level(), record.target(), record.args())
    }
}

impl<W: Write + Default> Log for KernelLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = W::default();
        // Nowhere to report a failing log sink.
        let _ = Self::write_record(&mut sink, record);
    }

    fn flush(&self) {}
}
