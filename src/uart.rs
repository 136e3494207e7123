//! Low-level driver routines for the 16550a UART.

use core::hint::spin_loop;
use core::ptr;

use crate::{
    console,
    kernel::kernel,
    lock::SleepableLock,
    memlayout::UART0,
};

/// The UART control registers are memory-mapped at address UART0. This
/// macro-free map gives the offset of each register.
///
/// Some have different meanings for read vs write:
/// see http://byterunner.com/16550.html
#[repr(usize)]
#[derive(Copy, Clone)]
enum UartReg {
    /// Receive holding register (for input bytes) on read;
    /// transmit holding register (for output bytes) on write.
    RhrThr = 0,

    /// Interrupt enable register.
    Ier = 1,

    /// FIFO control register on write; interrupt status on read.
    FcrIsr = 2,

    /// Line control register.
    Lcr = 3,

    /// Line status register.
    Lsr = 5,
}

const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;

const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clear the content of the two FIFOs.
const FCR_FIFO_CLEAR: u8 = 3 << 1;

/// Special mode to set the baud rate.
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Eight bits per byte, no parity.
const LCR_EIGHT_BITS: u8 = 3 << 0;

/// Input is waiting to be read from RHR.
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character to send.
const LSR_TX_IDLE: u8 = 1 << 5;

impl UartReg {
    fn read(self) -> u8 {
        // SAFETY: the kernel page table maps the UART registers; volatile
        // concurrent access of device registers is intended.
        unsafe { ptr::read_volatile((UART0 + self as usize) as *const u8) }
    }

    fn write(self, value: u8) {
        // SAFETY: as in read.
        unsafe { ptr::write_volatile((UART0 + self as usize) as *mut u8, value) }
    }
}

const UART_TX_BUF_SIZE: usize = 32;

/// The output ring for buffered (interrupt-driven) transmission.
pub struct UartTx {
    buf: [u8; UART_TX_BUF_SIZE],

    /// Write next to buf[tx_w % UART_TX_BUF_SIZE].
    w: u64,

    /// Read next from buf[tx_r % UART_TX_BUF_SIZE].
    r: u64,
}

impl UartTx {
    pub const fn new() -> Self {
        Self {
            buf: [0; UART_TX_BUF_SIZE],
            w: 0,
            r: 0,
        }
    }

    /// If the UART is idle and a character is waiting in the transmit
    /// buffer, send it. Called from both the top half (putc) and the
    /// bottom half (intr), with the tx lock held.
    fn start(&mut self) {
        loop {
            if self.w == self.r {
                // The transmit buffer is empty; clear any pending
                // interrupt condition.
                let _ = UartReg::FcrIsr.read();
                return;
            }

            if UartReg::Lsr.read() & LSR_TX_IDLE == 0 {
                // The UART transmit holding register is full; it will
                // interrupt when it is ready for a new byte.
                return;
            }

            let c = self.buf[(self.r % UART_TX_BUF_SIZE as u64) as usize];
            self.r += 1;

            UartReg::RhrThr.write(c);
        }
    }
}

impl SleepableLock<UartTx> {
    /// Add a character to the output buffer and tell the UART to start
    /// sending if it isn't already. Blocks if the output buffer is full,
    /// so it cannot be called from interrupts; it's only suitable for use
    /// by write().
    pub fn putc(&self, c: u8) {
        let mut tx = self.lock();

        if kernel().is_panicked() {
            loop {
                spin_loop();
            }
        }

        while tx.w == tx.r + UART_TX_BUF_SIZE as u64 {
            // The buffer is full; wait for start() to open up space.
            tx.sleep();
        }
        let w = tx.w;
        tx.buf[(w % UART_TX_BUF_SIZE as u64) as usize] = c;
        tx.w += 1;
        tx.start();

        // A sent byte made room; there may be more than one writer.
        tx.wakeup();
    }
}

/// Initialize the UART.
///
/// # Safety
///
/// Must run once at boot, before the first console output.
pub unsafe fn init() {
    // Disable interrupts.
    UartReg::Ier.write(0x00);

    // Special mode to set the baud rate.
    UartReg::Lcr.write(LCR_BAUD_LATCH);

    // LSB for baud rate of 38.4K.
    UartReg::RhrThr.write(0x03);

    // MSB for baud rate of 38.4K.
    UartReg::Ier.write(0x00);

    // Leave set-baud mode and set the word length to 8 bits, no parity.
    UartReg::Lcr.write(LCR_EIGHT_BITS);

    // Reset and enable FIFOs.
    UartReg::FcrIsr.write(FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

    // Enable transmit and receive interrupts.
    UartReg::Ier.write(IER_TX_ENABLE | IER_RX_ENABLE);
}

/// Alternate version of putc that doesn't use interrupts, for use by
/// kernel printing and to echo characters. It spins waiting for the UART's
/// output register to be empty.
pub fn putc_sync(c: u8) {
    // SAFETY: balanced by pop_off below.
    unsafe { crate::cpu::push_off() };

    if kernel().is_panicked() {
        loop {
            spin_loop();
        }
    }

    // Wait for Transmit Holding Empty to be set in LSR.
    while UartReg::Lsr.read() & LSR_TX_IDLE == 0 {
        spin_loop();
    }

    UartReg::RhrThr.write(c);

    unsafe { crate::cpu::pop_off() };
}

/// Read one input character from the UART, if one is waiting.
fn getc() -> Option<u8> {
    if UartReg::Lsr.read() & LSR_RX_READY != 0 {
        Some(UartReg::RhrThr.read())
    } else {
        None
    }
}

/// Handle a UART interrupt: raised because input has arrived, or the UART
/// is ready for more output, or both. Called from devintr().
pub fn intr() {
    // Read and process incoming characters.
    while let Some(c) = getc() {
        console::intr(c);
    }

    // Send buffered characters.
    kernel().uart_tx().lock().start();
}
