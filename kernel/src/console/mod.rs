//! Console input and output, to the UART.
//!
//! Reads are a line at a time. Implements special input characters:
//!
//! * newline -- end of line
//! * control-h -- backspace
//! * control-u -- kill line
//! * control-d -- end of file
//! * control-p -- print process list

use crate::{
    error::KernelError,
    file::{self, Device},
    proc::{self, ProcPrivateData},
    sync::{SpinLock, SpinLockCondVar},
};

pub mod print;
pub mod uart;

/// Console device major number.
pub const CONSOLE_MAJOR: i16 = 1;

const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const CTRL_H: u8 = ctrl(b'H');
const CTRL_U: u8 = ctrl(b'U');
const CTRL_D: u8 = ctrl(b'D');
const CTRL_P: u8 = ctrl(b'P');

const INPUT_BUF: usize = 128;

/// Sends one character to the UART.
///
/// Called by `println!()` and to echo input characters, but not from
/// user write()s.
pub fn put_char(c: char) {
    let mut buf = [0; 4];
    for b in c.encode_utf8(&mut buf).bytes() {
        uart::putc_sync(b);
    }
}

fn put_backspace() {
    uart::putc_sync(0x08);
    uart::putc_sync(b' ');
    uart::putc_sync(0x08);
}

struct Input {
    buf: [u8; INPUT_BUF],
    /// Read index.
    r: usize,
    /// Write index.
    w: usize,
    /// Edit index.
    e: usize,
}

static INPUT: SpinLock<Input> = SpinLock::new(Input {
    buf: [0; INPUT_BUF],
    r: 0,
    w: 0,
    e: 0,
});
static LINE_ARRIVED: SpinLockCondVar = SpinLockCondVar::new();

/// User write()s to the console go here.
fn write(
    private: &ProcPrivateData,
    user_src: bool,
    src: usize,
    n: usize,
) -> Result<usize, KernelError> {
    for i in 0..n {
        let mut c = [0u8; 1];
        if let Err(e) = proc::either_copy_in_bytes(private, &mut c, user_src, src + i) {
            if i > 0 {
                return Ok(i);
            }
            return Err(e);
        }
        uart::putc(c[0]);
    }
    Ok(n)
}

/// User read()s from the console go here.
///
/// Copies up to a whole input line to `dst`.
fn read(
    private: &ProcPrivateData,
    user_dst: bool,
    dst: usize,
    n: usize,
) -> Result<usize, KernelError> {
    let mut i = 0;
    let mut input = INPUT.lock();
    while i < n {
        // wait until the interrupt handler has put some
        // input into the buffer.
        while input.r == input.w {
            if proc::current_killed() {
                return Err(KernelError::ProcessKilled);
            }
            input = LINE_ARRIVED.wait(input);
        }

        let c = input.buf[input.r % INPUT_BUF];
        input.r += 1;

        // end-of-file
        if c == CTRL_D {
            if i > 0 {
                // Save ^D for next time, so the caller gets a
                // 0-byte result on the next read.
                input.r -= 1;
            }
            break;
        }

        if let Err(e) = proc::either_copy_out_bytes(private, user_dst, dst + i, &[c]) {
            if i > 0 {
                break;
            }
            return Err(e);
        }
        i += 1;

        if c == b'\n' {
            // a whole line has arrived; return to the user read().
            break;
        }
    }
    Ok(i)
}

/// Handles a console input character.
///
/// Does erase/kill processing, appends to the input buffer, and wakes
/// readers when a whole line has arrived.
pub fn handle_interrupt(c: u8) {
    let mut input = INPUT.lock();

    match c {
        // Print process list.
        CTRL_P => proc::dump(),
        // Kill line.
        CTRL_U => {
            while input.e != input.w && input.buf[(input.e - 1) % INPUT_BUF] != b'\n' {
                input.e -= 1;
                put_backspace();
            }
        }
        // Backspace or delete key.
        CTRL_H | 0x7f => {
            if input.e != input.w {
                input.e -= 1;
                put_backspace();
            }
        }
        _ => {
            if c != 0 && input.e - input.r < INPUT_BUF {
                let c = if c == b'\r' { b'\n' } else { c };

                // echo back to the user.
                put_char(c as char);

                // store for consumption by read().
                let idx = input.e % INPUT_BUF;
                input.buf[idx] = c;
                input.e += 1;

                if c == b'\n' || c == CTRL_D || input.e - input.r == INPUT_BUF {
                    input.w = input.e;
                    LINE_ARRIVED.notify();
                }
            }
        }
    }
}

pub fn init() {
    uart::init();

    file::register_device(CONSOLE_MAJOR, Device { read, write });
}
