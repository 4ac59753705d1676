//! Direct shim-based write for fatal diagnostics.
//!
//! Once the heap is found corrupted nothing may allocate anymore, so reports go straight to the
//! log target through this non-allocating writer.

use core::fmt;

use shim::syscalls;

use crate::sync::{Mutex, MutexGuard, SpinLock};

/// The log lock.
///
/// This lock is used to avoid bungling and intertwining the log.
static LOG_LOCK: Mutex<()> = Mutex::new(());

/// A log writer.
///
/// This writes to the shim's log target (stderr, by default).
pub struct LogWriter {
    /// The inner lock.
    _lock: MutexGuard<'static, (), SpinLock>,
}

impl LogWriter {
    /// Standard error output.
    pub fn new() -> LogWriter {
        LogWriter {
            _lock: LOG_LOCK.lock(),
        }
    }
}

impl fmt::Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if syscalls::log(s) < 0 {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}
