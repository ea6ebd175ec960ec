use std::io::Write;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing::warn;

use crate::device::Slot;

/// Rolling trace files for one device: everything it prints goes to
/// `<slot>.log`, error conditions additionally to `<slot>-error.log`.
/// Both rotate daily, named after the slot id.
pub(crate) struct DeviceTrace {
    out: Option<RollingFileAppender>,
    err: Option<RollingFileAppender>,
}

impl DeviceTrace {
    pub(crate) fn new(dir: &Path, slot: Slot) -> Self {
        Self {
            out: appender(dir, &format!("{slot}.log")),
            err: appender(dir, &format!("{slot}-error.log")),
        }
    }

    /// Append one line of device output.
    pub(crate) fn line(&mut self, line: &str) {
        if let Some(out) = &mut self.out {
            writeln!(out, "{}: {line}", timestamp()).ok();
        }
    }

    /// Append an error condition.
    pub(crate) fn error(&mut self, message: &str) {
        if let Some(err) = &mut self.err {
            writeln!(err, "{}: {message}", timestamp()).ok();
        }
    }
}

fn appender(dir: &Path, file_name: &str) -> Option<RollingFileAppender> {
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            warn!(?dir, %file_name, "Cannot write device traces: {e}");
            None
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
