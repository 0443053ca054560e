//! Formatted console output.

use core::{
    fmt::{self, Write as _},
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    console,
    sync::{SpinLock, SpinLockGuard},
};

/// Set on panic; freezes UART output from other harts.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

/// Lock to avoid interleaving concurrent prints.
struct Print {
    locking: AtomicBool,
    lock: SpinLock<()>,
}

static PRINT: Print = Print {
    locking: AtomicBool::new(true),
    lock: SpinLock::new(()),
};

impl Print {
    fn writer(&self) -> Writer<'_> {
        let guard = self
            .locking
            .load(Ordering::Relaxed)
            .then(|| self.lock.lock());
        Writer { _guard: guard }
    }
}

struct Writer<'a> {
    _guard: Option<SpinLockGuard<'a, ()>>,
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            console::put_char(c);
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments) {
    let mut writer = PRINT.writer();
    writer.write_fmt(args).unwrap();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // print without taking the lock; the panicking hart may hold it.
    PRINT.locking.store(false, Ordering::Relaxed);
    println!("panic: {info}");
    PANICKED.store(true, Ordering::Relaxed);
    loop {
        hint::spin_loop();
    }
}
