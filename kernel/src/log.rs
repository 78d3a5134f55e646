//! Wires the `log` facade to the same `Printer`/`Console` path `printf!`
//! uses, so `log::info!`/`log::debug!`/etc. interleave safely with
//! ordinary kernel output instead of racing it.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::printf;

pub struct KernelLogger;

pub static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        printf!(
            "[{:<5} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs `KernelLogger` as the global logger. Called once from
/// `kmain` on hart 0, before any other subsystem logs.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).expect("log::init: logger already set");
    log::set_max_level(level);
}
