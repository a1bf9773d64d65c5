//! Everything that can go wrong inside the shim.
//!
//! Most of these can't be handed back to the caller of `malloc()`, so they go
//! through [`fatal()`]. Only a failed dump is survivable.

use std::{ffi::CStr, io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShimError {
    /// `dlsym(RTLD_NEXT, ..)` found nothing behind us
    #[error("could not resolve the next definition of `{}`", .0.to_str().unwrap_or("?"))]
    Unresolved(&'static CStr),

    /// The recursion-breaking arena ran out
    #[error("bootstrap arena exhausted: {requested} bytes requested, {remaining} remaining")]
    ArenaExhausted { requested: usize, remaining: usize },

    #[error("could not mmap() {size} bytes: {errno}")]
    MapFailed { size: usize, errno: &'static str },

    /// More threads being created at once than there are trampoline slots
    #[error("more than {capacity} thread creations in flight")]
    TrampolinePoolExhausted { capacity: usize },

    #[error("could not write histogram to {}: {source}", .path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShimError>;

/// Report `err` on stderr and abort. Never allocates.
#[cold]
pub fn fatal(err: ShimError) -> ! {
    crate::eputln!("histalloc: fatal: {err}");
    // SAFETY: always safe to call
    unsafe { libc::abort() }
}
