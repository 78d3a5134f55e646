//! Formatted kernel output: writes through `Console` (an ordinary
//! `static`, not a `static mut`) and backs `log::Log` (see `src/log.rs`)
//! rather than being the only output path.

use core::fmt::{Arguments, Write};

use crate::console::CONSOLE;
use crate::spinlock::Spinlock;

pub static PRINTER: Printer = Printer {
    lock: Spinlock::init_lock("pr"),
};

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        $crate::printf::PRINTER.printf(core::format_args!($($arg)*))
    };
}

/// Serializes concurrent `printf!` callers across harts so one caller's
/// multi-argument write doesn't interleave with another's.
pub struct Printer {
    lock: Spinlock,
}

impl Printer {
    pub fn printf(&self, args: Arguments<'_>) {
        self.lock.acquire();
        let _ = (&CONSOLE).write_fmt(args);
        self.lock.release();
    }
}
