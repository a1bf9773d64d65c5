//! Startup configuration, read once from the environment.
//!
//! This is read lazily from inside the first `malloc()` call, so it must not
//! allocate: values come from `getenv()` and paths are copied into a fixed
//! buffer.

use std::{
    ffi::{CStr, OsStr},
    os::unix::ffi::OsStrExt,
    path::Path,
    str::FromStr,
    sync::OnceLock,
};

use log::LevelFilter;

use crate::logger;

pub const TRACK_THREADS_VAR: &CStr = c"HISTALLOC_TRACK_THREADS";
pub const LOG_VAR: &CStr = c"HISTALLOC_LOG";
pub const OUTPUT_VAR: &CStr = c"HISTALLOC_OUTPUT";

/// Where the histogram goes when `HISTALLOC_OUTPUT` is unset
pub const DEFAULT_OUTPUT: &str = ".histalloc.dat";
const OUTPUT_CAPACITY: usize = libc::PATH_MAX as usize;

/// How much bookkeeping each allocation gets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tracking {
    /// Size histogram only. Pointers are handed out untouched.
    CountsOnly = 1,
    /// Every block carries an [`AllocationHeader`](crate::alloc::header::AllocationHeader)
    /// so that `free()` can tell whether the allocating thread is the one
    /// releasing it.
    SameThreadFrees = 2,
}

impl Tracking {
    pub const fn from_u8(value: u8) -> Option<Tracking> {
        match value {
            1 => Some(Tracking::CountsOnly),
            2 => Some(Tracking::SameThreadFrees),
            _ => None,
        }
    }

    pub const fn tracks_frees(self) -> bool {
        matches!(self, Tracking::SameThreadFrees)
    }
}

/// A path stored inline, so building a [`Config`] doesn't need the heap
pub struct OutputPath {
    buf: [u8; OUTPUT_CAPACITY],
    len: usize,
}

impl OutputPath {
    /// `None` if `bytes` is empty or longer than `PATH_MAX`
    pub fn new(bytes: &[u8]) -> Option<OutputPath> {
        if bytes.is_empty() || bytes.len() > OUTPUT_CAPACITY {
            return None;
        }
        let mut buf = [0; OUTPUT_CAPACITY];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(OutputPath {
            buf,
            len: bytes.len(),
        })
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..self.len]))
    }
}

pub struct Config {
    pub tracking: Tracking,
    pub log_level: LevelFilter,
    pub output: OutputPath,
}

impl Config {
    /// Build a config from `lookup`, which maps a variable name to its value
    pub fn from_lookup<'a, F>(lookup: F) -> Config
    where
        F: Fn(&CStr) -> Option<&'a [u8]>,
    {
        let tracking = match lookup(TRACK_THREADS_VAR) {
            Some(value) if is_falsy(value) => Tracking::CountsOnly,
            _ => Tracking::SameThreadFrees,
        };
        let log_level = lookup(LOG_VAR)
            .and_then(|value| std::str::from_utf8(value).ok())
            .and_then(|value| LevelFilter::from_str(value.trim()).ok())
            .unwrap_or(LevelFilter::Warn);
        let output = lookup(OUTPUT_VAR)
            .and_then(OutputPath::new)
            .or_else(|| OutputPath::new(DEFAULT_OUTPUT.as_bytes()))
            .unwrap_or_else(|| OutputPath {
                buf: [0; OUTPUT_CAPACITY],
                len: 0,
            });
        Config {
            tracking,
            log_level,
            output,
        }
    }

    /// Build a config from the process environment
    pub fn from_env() -> Config {
        Config::from_lookup(getenv)
    }
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
    // SAFETY: `name` is NUL-terminated. The environment isn't modified by
    // anything that runs this early, and we copy what we keep.
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        None
    } else {
        // SAFETY: `getenv()` returns a NUL-terminated string
        Some(unsafe { CStr::from_ptr(value) }.to_bytes())
    }
}

const FALSY: [&[u8]; 4] = [b"0", b"false", b"off", b"no"];

fn is_falsy(value: &[u8]) -> bool {
    FALSY
        .iter()
        .any(|falsy| value.eq_ignore_ascii_case(falsy))
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process-wide config. The first call reads the environment and installs
/// the logger.
pub fn get() -> &'static Config {
    CONFIG.get_or_init(|| {
        let config = Config::from_env();
        logger::init(config.log_level);
        log::debug!(
            "config: tracking = {:?}, output = {}",
            config.tracking,
            config.output.as_path().display()
        );
        config
    })
}
