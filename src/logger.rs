//! A `log` backend that is safe to call from inside `malloc()`.
//!
//! Every record is formatted into a [`StackBuf`] and written with a single
//! `write(2)`, so lines from different threads don't interleave and nothing
//! ever touches the heap.

use std::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::util::print::{put_stderr, StackBuf, LINE_CAPACITY};

pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut buf = StackBuf::<LINE_CAPACITY>::new();
        // SAFETY: always safe to call
        let thread = unsafe { libc::pthread_self() };
        let _ = write!(
            buf,
            "[histalloc {} {:#x}] {}",
            record.level(),
            thread as usize,
            record.args()
        );
        buf.finish_line();
        put_stderr(buf.as_bytes());
    }

    fn flush(&self) {}
}

/// Install [`StderrLogger`] at `level`. If a logger is already installed (the
/// unit tests install `env_logger`) that one stays and only the level changes.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
