//! Low-level driver for the 16550a UART.

use core::{hint, ptr, sync::atomic::Ordering};

use crate::{console, interrupt, memory::layout::UART0, proc, sync::SpinLock};

use super::print::PANICKED;

const fn reg(offset: usize) -> *mut u8 {
    ptr::without_provenance_mut::<u8>(UART0 + offset)
}

// The UART control registers; some have different meanings for read
// vs. write. See http://byterunner.com/16550.html

/// Receive holding register (input bytes).
const RHR: usize = 0;
/// Transmit holding register (output bytes).
const THR: usize = 0;
/// Interrupt enable register.
const IER: usize = 1;
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
/// FIFO control register.
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clears the content of both FIFOs.
const FCR_FIFO_CLEAR: u8 = 3 << 1;
/// Interrupt status register.
const ISR: usize = 2;
/// Line control register.
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
/// Special mode to set the baud rate.
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Line status register.
const LSR: usize = 5;
/// Input is waiting to be read from RHR.
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character to send.
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn read_reg(offset: usize) -> u8 {
    unsafe { reg(offset).read_volatile() }
}

unsafe fn write_reg(offset: usize, data: u8) {
    unsafe { reg(offset).write_volatile(data) }
}

/// The interrupt-driven transmit ring.
struct TxBuffer {
    buf: [u8; 32],
    /// Write next to buf[w % buf.len()].
    w: usize,
    /// Read next from buf[r % buf.len()].
    r: usize,
}

impl TxBuffer {
    fn is_full(&self) -> bool {
        self.w == self.r + self.buf.len()
    }

    fn is_empty(&self) -> bool {
        self.w == self.r
    }

    fn push(&mut self, c: u8) {
        assert!(!self.is_full());
        self.buf[self.w % self.buf.len()] = c;
        self.w += 1;
    }

    fn pop(&mut self) -> u8 {
        assert!(!self.is_empty());
        let c = self.buf[self.r % self.buf.len()];
        self.r += 1;
        c
    }
}

static TX_BUFFER: SpinLock<TxBuffer> = SpinLock::new(TxBuffer {
    buf: [0; 32],
    w: 0,
    r: 0,
});

pub fn init() {
    unsafe {
        // disable interrupts.
        write_reg(IER, 0x00);

        // special mode to set baud rate.
        write_reg(LCR, LCR_BAUD_LATCH);

        // LSB and MSB for baud rate of 38.4K.
        write_reg(0, 0x03);
        write_reg(1, 0x00);

        // leave set-baud mode and set word length to 8 bits, no parity.
        write_reg(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs.
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // enable transmit and receive interrupts.
        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }
}

/// Adds a character to the output ring and starts the transmitter.
///
/// Blocks if the ring is full, so it cannot be called from interrupt
/// context; it is only suitable for write().
pub fn putc(c: u8) {
    let mut tx = TX_BUFFER.lock();

    if PANICKED.load(Ordering::Relaxed) {
        loop {
            hint::spin_loop();
        }
    }

    while tx.is_full() {
        // wait for start() to open up space in the ring.
        tx = proc::sleep(ptr::from_ref(&tx.r).addr(), tx);
    }
    tx.push(c);
    start(&mut tx);
}

/// Sends a character to the UART synchronously, spinning until the
/// transmit register is free.
///
/// For use by kernel printing and to echo input; does not depend on
/// interrupts.
pub fn putc_sync(c: u8) {
    interrupt::with_push_disabled(|| {
        if PANICKED.load(Ordering::Relaxed) {
            loop {
                hint::spin_loop();
            }
        }

        while (unsafe { read_reg(LSR) } & LSR_TX_IDLE) == 0 {
            hint::spin_loop();
        }

        unsafe {
            write_reg(THR, c);
        }
    });
}

/// Feeds the UART from the transmit ring while it will take characters.
///
/// Caller must hold the TX_BUFFER lock. Called from both the top half
/// (putc) and the bottom half (handle_interrupt).
fn start(tx: &mut TxBuffer) {
    loop {
        if tx.is_empty() {
            unsafe {
                read_reg(ISR);
            }
            return;
        }

        if unsafe { read_reg(LSR) } & LSR_TX_IDLE == 0 {
            // the transmit holding register is full; the UART will
            // interrupt when it wants another byte.
            return;
        }

        let c = tx.pop();

        // putc() may be waiting for space in the ring.
        proc::wakeup(ptr::from_ref(&tx.r).addr());

        unsafe {
            write_reg(THR, c);
        }
    }
}

/// Reads one input character, if any is waiting.
fn getc() -> Option<u8> {
    ((unsafe { read_reg(LSR) } & LSR_RX_READY) != 0).then(|| unsafe { read_reg(RHR) })
}

/// Handles a UART interrupt: input arrived, the transmitter wants more
/// output, or both.
pub fn handle_interrupt() {
    // read and process incoming characters.
    while let Some(c) = getc() {
        console::handle_interrupt(c);
    }

    // send buffered characters.
    let mut tx = TX_BUFFER.lock();
    start(&mut tx);
}
