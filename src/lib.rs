//! `LD_PRELOAD` this to get a histogram of every allocation size a program
//! asks for, plus how many of those blocks were freed by the thread that
//! allocated them.
//!
//! ```text
//! LD_PRELOAD=target/release/libhistalloc.so HISTALLOC_OUTPUT=allocs.dat ./program
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod os;
pub mod util;

// Exporting `malloc` from the test harness would put it on top of itself
#[cfg(not(test))]
mod externc;
