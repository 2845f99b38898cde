//! Serial-backed `log` implementation.
//!
//! Messages logged before the serial port is initialized are staged in a
//! fixed buffer and flushed once `serial_ready()` is called. The maximum
//! level is adjustable at boot from the `loglevel=` kernel parameter.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

const BUFFER_SIZE: usize = 8192;

/// Buffer for storing log messages before serial is initialized
struct LogBuffer {
    buffer: [u8; BUFFER_SIZE],
    position: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            position: 0,
        }
    }

    fn contents(&self) -> &str {
        core::str::from_utf8(&self.buffer[..self.position]).unwrap_or("<invalid UTF-8>")
    }
}

impl Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = BUFFER_SIZE - self.position;
        if bytes.len() > remaining {
            // Full; drop the message rather than fault this early in boot.
            return Ok(());
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }
}

enum LoggerState {
    /// Buffering messages until serial is ready
    Buffering,
    /// Serial is initialized, output directly
    SerialReady,
}

pub struct KernelLogger {
    buffer: Mutex<LogBuffer>,
    state: Mutex<LoggerState>,
}

impl KernelLogger {
    const fn new() -> Self {
        KernelLogger {
            buffer: Mutex::new(LogBuffer::new()),
            state: Mutex::new(LoggerState::Buffering),
        }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // try_lock so logging from interrupt context cannot deadlock against
        // a task mid-log; fall back to a direct line in that case.
        let state = match self.state.try_lock() {
            Some(state) => state,
            None => {
                let _ = crate::serial::try_print(format_args!(
                    "[INTR] {}: {}\n",
                    record.target(),
                    record.args()
                ));
                return;
            }
        };

        match *state {
            LoggerState::Buffering => {
                drop(state);
                if let Some(mut buffer) = self.buffer.try_lock() {
                    let _ = write!(
                        &mut *buffer,
                        "[{:>5}] {}: {}\n",
                        record.level(),
                        record.target(),
                        record.args()
                    );
                }
            }
            LoggerState::SerialReady => {
                drop(state);
                crate::serial_println!(
                    "[{:>5}] {}: {}",
                    record.level(),
                    record.target(),
                    record.args()
                );
            }
        }
    }

    fn flush(&self) {}
}

pub static LOGGER: KernelLogger = KernelLogger::new();

/// Install the logger - can be called before serial is ready.
pub fn init_early() {
    log::set_logger(&LOGGER).expect("Logger already set");
    log::set_max_level(LevelFilter::Info);
}

/// Flush buffered boot messages; call after the serial port is initialized.
pub fn serial_ready() {
    let mut state = LOGGER.state.lock();
    let buffer = LOGGER.buffer.lock();
    if buffer.position > 0 {
        crate::serial_println!("{}", buffer.contents());
    }
    *state = LoggerState::SerialReady;
}

/// Adjust the maximum level; wired to the `loglevel=` kernel parameter.
pub fn set_max_level(filter: LevelFilter) {
    log::set_max_level(filter);
}
