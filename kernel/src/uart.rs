//! 16550 UART driver: synchronous output, plus just enough polled input
//! to back the `scan` syscall's line reader. The interrupt-driven
//! line-discipline `Console` the TTY would need is dropped -- that shell
//! front end is an external collaborator this kernel doesn't implement.

use crate::memlayout::UART0;
use crate::spinlock::Spinlock;

#[macro_export]
macro_rules! Reg {
    ( $reg:expr ) => {
        $crate::memlayout::UART0 + ($reg as usize)
    };
}

pub const THR: u8 = 0; // transmit holding register (write)
pub const IER: u8 = 1; // interrupt enable register
pub const FCR: u8 = 2; // FIFO control register
pub const FCR_FIFO_ENABLE: u8 = 1 << 0;
pub const FCR_FIFO_CLEAR: u8 = 3 << 1;
pub const LCR: u8 = 3; // line control register
pub const LCR_EIGHT_BITS: u8 = 3 << 0;
pub const LCR_BAUD_LATCH: u8 = 1 << 7;
pub const RBR: u8 = 0; // receive buffer register (read), same offset as THR
pub const LSR: u8 = 5; // line status register
pub const LSR_RX_READY: u8 = 1 << 0;
pub const LSR_TX_IDLE: u8 = 1 << 5;

#[macro_export]
macro_rules! ReadReg {
    ( $reg:expr ) => {
        unsafe { ($crate::Reg!($reg) as *mut u8).read_volatile() }
    };
}
#[macro_export]
macro_rules! WriteReg {
    ( $reg:expr, $val:expr ) => {
        unsafe { ($crate::Reg!($reg) as *mut u8).write_volatile($val) }
    };
}

pub struct Uart {
    lock: Spinlock,
}

pub static UART_INSTANCE: Uart = Uart::create();

impl Uart {
    pub const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("uart"),
        }
    }

    pub fn init(&self) {
        WriteReg!(IER, 0x00);
        WriteReg!(LCR, LCR_BAUD_LATCH);
        WriteReg!(0, 0x03); // LSB for 38.4K baud
        WriteReg!(1, 0x00); // MSB for 38.4K baud
        WriteReg!(LCR, LCR_EIGHT_BITS);
        WriteReg!(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
    }

    /// Spins waiting for the transmit holding register to go idle, then
    /// writes one byte. Safe to call from panic/log paths with interrupts
    /// disabled.
    pub fn putc_sync(&self, c: u8) {
        self.lock.acquire();
        while (ReadReg!(LSR) & LSR_TX_IDLE) == 0 {}
        WriteReg!(THR, c);
        self.lock.release();
    }

    /// Spins until a byte is available, then returns it.
    pub fn getc_sync(&self) -> u8 {
        self.lock.acquire();
        while (ReadReg!(LSR) & LSR_RX_READY) == 0 {}
        let c = ReadReg!(RBR);
        self.lock.release();
        c
    }
}

#[cfg(test)]
mod tests {
    // UART registers are memory-mapped I/O; there is nothing to unit test
    // on the host beyond register-layout constants staying distinct.
    use super::*;

    #[test]
    fn register_offsets_are_distinct() {
        let offsets = [THR, IER, FCR, LCR, LSR];
        for (i, a) in offsets.iter().enumerate() {
            for (j, b) in offsets.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "register offsets must be distinct");
                }
            }
        }
    }
}
