//! Kernel print utilities.
//!
//! Messages are formatted into whatever [`Console`] was registered with
//! [`set_console`]. Until a console is registered, output is discarded.

use crate::spinlock::SpinLock;
use core::fmt::Write;

/// A sink for console output.
pub trait Console: Sync {
    /// Writes `s` to the device.
    fn write_str(&self, s: &str);
}

static CONSOLE: SpinLock<Option<&'static dyn Console>> = SpinLock::new(None);

/// Registers the device that [`print!`] and friends write to.
///
/// Replaces the previously registered console, if any.
pub fn set_console(console: &'static dyn Console) {
    let mut guard = CONSOLE.lock();
    *guard = Some(console);
    guard.unlock();
}

struct Sink(&'static dyn Console);

impl Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let guard = CONSOLE.lock();
    let console = *guard;
    guard.unlock();
    if let Some(console) = console {
        let _ = write!(Sink(console), "{fmt}");
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the registered console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the registered console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
///
/// Use the format! syntax to write data to the registered console.
/// Muted while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the registered console.
/// Muted while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the registered console.
/// Muted while [`QUITE`](crate::QUITE) is set.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
