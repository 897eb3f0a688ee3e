//! Console output for doorkern
//!
//! Provides the byte sink behind `print!`/`println!` and the `log` backend
//! used by the rest of the kernel. On a board the sink is a function that
//! pushes one byte into a UART; under test the text is also captured per
//! thread, so parallel tests only see their own output.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Console writer interface
pub struct Console {
    sink: Option<fn(u8)>,
}

#[cfg(test)]
std::thread_local! {
    static CAPTURE: core::cell::RefCell<std::string::String> =
        const { core::cell::RefCell::new(std::string::String::new()) };
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console { sink: None }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                CAPTURE.with(|c| c.borrow_mut().push(byte as char));
            }
        }

        if let Some(sink) = self.sink {
            sink(byte);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                // Serial terminals want CRLF
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        CAPTURE.with(|c| c.borrow_mut().clear());
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Route console output to a board byte sink
pub fn init(sink: fn(u8)) {
    let mut console = CONSOLE.lock();
    console.clear();
    console.sink = Some(sink);
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Log backend
// ============================================================================

/// `log` backend writing `[LEVEL] target: message` lines to the console
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Records from an ISR that interrupted a console writer are dropped
        if let Some(mut console) = CONSOLE.try_lock() {
            let _ = writeln!(
                console,
                "[{:<5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the console as the `log` backend
///
/// Only the first call installs the logger; later calls just change the
/// level filter.
pub fn init_logger(level: LevelFilter) {
    // An already installed logger is kept
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
pub(crate) fn captured() -> std::string::String {
    CAPTURE.with(|c| c.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_console_capture() {
        crate::println!("door {} ready", 3);
        assert!(captured().contains("door 3 ready\r\n"));
    }

    #[test]
    fn test_logger_writes_console() {
        init_logger(LevelFilter::Info);
        log::info!(target: "console-test", "hello {}", 42);
        assert!(captured().contains("[INFO ] console-test: hello 42\r\n"));
    }

    #[test]
    fn test_logger_skips_busy_console() {
        init_logger(LevelFilter::Info);
        let held = CONSOLE.lock();
        LOGGER.log(
            &Record::builder()
                .args(format_args!("from an interrupt"))
                .level(Level::Warn)
                .target("console-test")
                .build(),
        );
        drop(held);
        assert!(!captured().contains("from an interrupt"));

        log::warn!(target: "console-test", "after release");
        assert!(captured().contains("console-test: after release"));
    }
}
