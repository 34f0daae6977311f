//! Append-only operation log
//!
//! One text line per logged cache operation, for offline analysis of
//! access patterns. Two independent states gate emission: the log is
//! *enabled* while a file handle is open, and *logging* while the runtime
//! toggle is on. Both are queryable separately so a caller can open the
//! log early and start/stop logging around the region of interest.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tessera_common::Result;
use tracing::debug;

/// Append-only text log of cache operations
#[derive(Default)]
pub struct OpLog {
    writer: Option<BufWriter<File>>,
    logging: bool,
}

impl OpLog {
    /// Create a log in the disabled state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the log file, enabling the log
    ///
    /// Logging does not start until [`OpLog::start`] unless `start_now`.
    pub fn enable(&mut self, path: impl AsRef<Path>, start_now: bool) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(BufWriter::new(file));
        self.logging = start_now;
        debug!(path = %path.as_ref().display(), start_now, "op log enabled");
        Ok(())
    }

    /// Flush and close the log file, disabling the log
    pub fn disable(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.logging = false;
        Ok(())
    }

    /// Turn the runtime toggle on; no-op while disabled
    pub fn start(&mut self) {
        if self.writer.is_some() {
            self.logging = true;
        }
    }

    /// Turn the runtime toggle off
    pub fn stop(&mut self) {
        self.logging = false;
    }

    /// Whether a log file is open
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Whether operations are currently being written
    #[must_use]
    pub const fn is_logging(&self) -> bool {
        self.logging && self.writer.is_some()
    }

    /// Write one line; silently skipped unless enabled and logging
    pub fn record(&mut self, line: std::fmt::Arguments<'_>) -> Result<()> {
        if !self.is_logging() {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }
}

/// Log one operation line if the log is active
macro_rules! log_op {
    ($log:expr, $($arg:tt)*) => {
        $log.record(format_args!($($arg)*))?
    };
}
pub(crate) use log_op;
