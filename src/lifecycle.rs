//! Process and thread setup and teardown, and the process-wide state they
//! manage.

use std::{
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use libc::{c_void, pthread_key_t};
use once_cell::race::OnceNonZeroUsize;

use crate::{
    alloc::{
        histogram::Registry,
        interpose::{Interposer, NextSymbols},
        resolve::Symbol,
    },
    config,
    error::{fatal, ShimError},
    os::thread::{PthreadCreateFn, TrampolinePool},
};

/// The allocator every exported entry point goes through
pub static INTERPOSER: Interposer<NextSymbols> = Interposer::new(NextSymbols::new());

/// Where finished threads leave their counts
pub static REGISTRY: Registry = Registry::new();

pub static TRAMPOLINES: TrampolinePool = TrampolinePool::new();

pub static PTHREAD_CREATE: Symbol<PthreadCreateFn> = Symbol::new(c"pthread_create");

static PROCESS: ProcessState = ProcessState::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninit = 0,
    Init = 1,
    Finalized = 2,
}

/// An atomic [`LifecycleState`]. Each transition happens at most once, no
/// matter how many times or from how many threads it is attempted.
pub struct ProcessState(AtomicU8);

impl ProcessState {
    pub const fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Uninit as u8))
    }

    pub fn get(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            0 => LifecycleState::Uninit,
            1 => LifecycleState::Init,
            _ => LifecycleState::Finalized,
        }
    }

    /// Move to `Init`. True only for the call that did it.
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::Uninit as u8,
                LifecycleState::Init as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Finalized`, from either earlier state. True only for the call
    /// that did it.
    pub fn finish(&self) -> bool {
        self.0.swap(LifecycleState::Finalized as u8, Ordering::AcqRel)
            != LifecycleState::Finalized as u8
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

/// The key whose destructor merges an exiting thread, stored off by one so
/// that key 0 fits in a [`OnceNonZeroUsize`]
static THREAD_EXIT_KEY: OnceNonZeroUsize = OnceNonZeroUsize::new();

fn thread_exit_key() -> Option<pthread_key_t> {
    THREAD_EXIT_KEY
        .get_or_try_init(|| {
            let mut key: pthread_key_t = 0;
            // SAFETY: `key` is a valid out pointer
            let rc = unsafe { libc::pthread_key_create(&mut key, Some(on_thread_exit)) };
            if rc != 0 {
                log::warn!("pthread_key_create() failed: {rc}");
                return Err(());
            }
            NonZeroUsize::new(key as usize + 1).ok_or(())
        })
        .ok()
        .map(|key| (key.get() - 1) as pthread_key_t)
}

unsafe extern "C" fn on_thread_exit(_: *mut c_void) {
    thread_finalize();
}

/// Runs once, when the library is loaded. Everything the allocation path needs
/// is looked up here, so a missing symbol is reported now rather than as a
/// crash later.
pub fn process_initialize() {
    if !PROCESS.begin() {
        return;
    }
    let config = config::get();
    if let Err(err) = INTERPOSER.backend().resolve_required() {
        fatal(err);
    }
    if PTHREAD_CREATE.try_get().is_none() {
        fatal(ShimError::Unresolved(PTHREAD_CREATE.name()));
    }
    let tracking = INTERPOSER.tracking();
    if thread_exit_key().is_none() {
        log::warn!("threads will exit without merging their counts");
    }
    // SAFETY: `at_exit` is a plain `extern "C" fn()`
    if unsafe { libc::atexit(at_exit) } != 0 {
        log::warn!("atexit() failed, relying on the library destructor");
    }
    log::debug!(
        "process initialized: tracking = {tracking:?}, output = {}",
        config.output.as_path().display()
    );
}

extern "C" fn at_exit() {
    process_finalize();
}

/// Runs once, at exit or unload, whichever comes first. The calling thread is
/// merged (the main thread never went through `pthread_create()`) and the
/// histogram is written out.
pub fn process_finalize() {
    if !PROCESS.finish() {
        return;
    }
    thread_finalize();
    let path = config::get().output.as_path();
    match REGISTRY.dump(path, INTERPOSER.tracking().tracks_frees()) {
        Ok(()) => log::debug!("histogram written to {}", path.display()),
        Err(err) => log::error!("{err}"),
    }
}

/// Arrange for [`thread_finalize()`] to run when the calling thread exits
pub fn thread_initialize() {
    let Some(key) = thread_exit_key() else {
        return;
    };
    // Destructors only run for non-null values, what the value is doesn't
    // matter
    let marker = NonNull::<c_void>::dangling().as_ptr();
    // SAFETY: `key` came from `pthread_key_create()`
    let rc = unsafe { libc::pthread_setspecific(key, marker) };
    if rc != 0 {
        log::warn!("pthread_setspecific() failed: {rc}");
    }
    log::trace!("thread initialized");
}

/// Hand the calling thread's counts to [`REGISTRY`]. Anything the thread does
/// afterwards isn't counted.
pub fn thread_finalize() {
    REGISTRY.merge_current_thread();
    log::trace!("thread finalized");
}
