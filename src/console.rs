//! Console input and output, to the UART.
//!
//! Reads are line at a time and implement the special input characters:
//!   newline -- end of line
//!   control-h -- backspace
//!   control-u -- kill line
//!   control-d -- end of file
//!   control-p -- print process list

use crate::{
    error::{KernelError, Result},
    kernel::kernel,
    proc::current_proc,
    uart,
    vm::{Addr, UVAddr},
};

/// The console's major device number.
pub const CONSOLE_MAJOR: usize = 1;

const CTRL_D: u8 = ctrl(b'D');
const CTRL_H: u8 = ctrl(b'H');
const CTRL_P: u8 = ctrl(b'P');
const CTRL_U: u8 = ctrl(b'U');

const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

/// The sequence the terminal understands as "rub out the last character".
const BACKSPACE_OUT: [u8; 3] = [0x08, b' ', 0x08];

const INPUT_BUF_SIZE: usize = 128;

pub struct Console {
    buf: [u8; INPUT_BUF_SIZE],

    /// Read index.
    r: u32,

    /// Write index: input up to here has been committed by a newline.
    w: u32,

    /// Edit index: input up to here is still editable.
    e: u32,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

/// Send one character to the UART, expanding backspace into the rub-out
/// sequence. Used to echo input and by the kernel printer.
pub fn putc(c: u8) {
    if c == CTRL_H || c == 0x7f {
        for b in BACKSPACE_OUT.iter() {
            uart::putc_sync(*b);
        }
    } else {
        uart::putc_sync(c);
    }
}

/// The console half of the write system call: copy the bytes in from user
/// space and hand them to the UART.
pub fn write(src: UVAddr, n: usize) -> Result<usize> {
    let mut proc = current_proc().expect("console::write");
    for i in 0..n {
        let mut c = [0u8];
        if proc.memory_mut().copy_in_bytes(&mut c, src.add(i)).is_err() {
            return Ok(i);
        }
        kernel().uart_tx().putc(c[0]);
    }
    Ok(n)
}

/// The console half of the read system call: copy a line of input (or as
/// much of it as fits) out to user space. An EOF (^D) ends the read early.
pub fn read(dst: UVAddr, n: usize) -> Result<usize> {
    let mut proc = current_proc().expect("console::read");
    let target = n;
    let mut n = n;
    let mut dst = dst;

    let mut cons = kernel().console().lock();
    while n > 0 {
        // Wait until interrupt handlers have put some input into the
        // buffer.
        while cons.r == cons.w {
            if proc.killed() {
                return Err(KernelError::ProcIsKilled);
            }
            cons.sleep();
        }

        let c = cons.buf[cons.r as usize % INPUT_BUF_SIZE];
        cons.r += 1;

        if c == CTRL_D {
            // End of file.
            if n < target {
                // Save ^D for next time, to make sure the caller gets a
                // 0-byte result.
                cons.r -= 1;
            }
            break;
        }

        // Copy the input byte to the user-space buffer.
        if proc.memory_mut().copy_out_bytes(dst, &[c]).is_err() {
            break;
        }

        dst = dst.add(1);
        n -= 1;

        if c == b'\n' {
            // A whole line has arrived; return to the user-level read.
            break;
        }
    }

    Ok(target - n)
}

/// The console input interrupt handler: uart::intr() calls this for every
/// input character. Do erase/kill processing, append to the buffer, wake
/// up read() if a whole line has arrived.
pub fn intr(c: u8) {
    let mut cons = kernel().console().lock();

    match c {
        CTRL_P => {
            // Print the process list.
            kernel().procs().dump();
        }
        CTRL_U => {
            // Kill the line.
            while cons.e != cons.w && cons.buf[(cons.e - 1) as usize % INPUT_BUF_SIZE] != b'\n' {
                cons.e -= 1;
                putc(CTRL_H);
            }
        }
        CTRL_H | 0x7f => {
            // Backspace.
            if cons.e != cons.w {
                cons.e -= 1;
                putc(CTRL_H);
            }
        }
        _ => {
            if c != 0 && cons.e.wrapping_sub(cons.r) < INPUT_BUF_SIZE as u32 {
                let c = if c == b'\r' { b'\n' } else { c };

                // Echo back to the user.
                putc(c);

                // Store for consumption by read().
                let e = cons.e;
                cons.buf[e as usize % INPUT_BUF_SIZE] = c;
                cons.e += 1;

                if c == b'\n' || c == CTRL_D || cons.e == cons.r + INPUT_BUF_SIZE as u32 {
                    // Wake up read() if a whole line (or EOF) has arrived.
                    cons.w = cons.e;
                    cons.wakeup();
                }
            }
        }
    }
}
