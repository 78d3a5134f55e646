//! Kernel console: a `core::fmt::Write` sink over the UART, used by
//! `printf!` and by `KernelLogger`. Stripped of line-discipline input
//! handling (`consoleintr`, the file-device binding) since the
//! interactive TTY is an external collaborator this kernel doesn't
//! implement.

use core::fmt::{Error, Write};

use crate::spinlock::Spinlock;
use crate::uart::UART_INSTANCE;

pub struct Console {
    lock: Spinlock,
}

pub static CONSOLE: Console = Console::create();

impl Console {
    pub const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("cons"),
        }
    }

    pub fn init(&self) {
        UART_INSTANCE.init();
    }

    pub fn putc(&self, c: u8) {
        UART_INSTANCE.putc_sync(c);
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        self.lock.acquire();
        for &b in bytes {
            self.putc(b);
        }
        self.lock.release();
    }

    /// Reads up to `buf.len()` bytes, stopping at (and consuming, but not
    /// storing) a newline. Echoes each byte back as it's read. Returns
    /// the number of bytes stored.
    pub fn read_line(&self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let c = UART_INSTANCE.getc_sync();
            if c == b'\r' || c == b'\n' {
                self.putc(b'\n');
                break;
            }
            self.putc(c);
            buf[n] = c;
            n += 1;
        }
        n
    }
}

impl Write for &Console {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
