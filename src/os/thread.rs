//! Getting every new thread to run our init and exit hooks.
//!
//! `pthread_create()` can't just box up `(start, arg)` for the new thread,
//! boxing is `malloc()`. Instead the pair goes into a slot of a static
//! [`TrampolinePool`], and the thread starts in [`trampoline()`], which copies
//! the pair out, frees the slot, and then runs the real thing.

use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;
use libc::{c_int, c_void, pthread_attr_t, pthread_t};

use crate::{
    error::{fatal, Result, ShimError},
    lifecycle,
};

pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
pub type PthreadCreateFn =
    unsafe extern "C" fn(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int;

/// Thread creations that can be in flight at once
pub const TRAMPOLINE_CAPACITY: usize = 10_000;

pub struct Slot {
    busy: AtomicBool,
    start: UnsafeCell<Option<StartRoutine>>,
    arg: UnsafeCell<*mut c_void>,
}

// SAFETY: `start` and `arg` are only touched by whoever set `busy`
unsafe impl Sync for Slot {}

impl Slot {
    const EMPTY: Slot = Slot {
        busy: AtomicBool::new(false),
        start: UnsafeCell::new(None),
        arg: UnsafeCell::new(ptr::null_mut()),
    };

    /// Copy the entry point out and give the slot back
    ///
    /// # Safety
    ///
    /// The slot must have been claimed and filled, and not taken since
    unsafe fn take(&self) -> (Option<StartRoutine>, *mut c_void) {
        // SAFETY: we hold the slot, as promised by the caller
        let entry = unsafe { (*self.start.get(), *self.arg.get()) };
        self.release();
        entry
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct TrampolinePool<const N: usize = TRAMPOLINE_CAPACITY> {
    slots: [Slot; N],
    next: CachePadded<AtomicUsize>,
}

impl<const N: usize> TrampolinePool<N> {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::EMPTY; N],
            next: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Park `(start, arg)` in the next slot. Slots are handed out round-robin,
    /// so this only fails if the one we land on still hasn't been picked up,
    /// meaning `N` creations are in flight at once.
    pub fn claim(&self, start: StartRoutine, arg: *mut c_void) -> Result<&Slot> {
        let slot = &self.slots[self.next.fetch_add(1, Ordering::Relaxed) % N];
        if slot.busy.swap(true, Ordering::Acquire) {
            return Err(ShimError::TrampolinePoolExhausted { capacity: N });
        }
        // SAFETY: we just set `busy`, nobody else is looking
        unsafe {
            *slot.start.get() = Some(start);
            *slot.arg.get() = arg;
        }
        Ok(slot)
    }

    /// Slots claimed but not yet picked up by their thread
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.busy.load(Ordering::Relaxed))
            .count()
    }
}

impl<const N: usize> Default for TrampolinePool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// First thing every new thread runs
extern "C" fn trampoline(slot: *mut c_void) -> *mut c_void {
    // SAFETY: `spawn_through()` passes a claimed, filled slot of a static pool
    let (start, arg) = unsafe { (*slot.cast::<Slot>()).take() };
    lifecycle::thread_initialize();
    match start {
        Some(start) => start(arg),
        None => ptr::null_mut(),
    }
}

/// `pthread_create()` through `real`, with the new thread starting in
/// [`trampoline()`]
///
/// # Safety
///
/// Same as `pthread_create()`, and `real` must be a `pthread_create()`
pub unsafe fn spawn_through<const N: usize>(
    pool: &'static TrampolinePool<N>,
    real: PthreadCreateFn,
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let slot = match pool.claim(start, arg) {
        Ok(slot) => slot,
        Err(err) => fatal(err),
    };
    let rc = real(thread, attr, trampoline, (slot as *const Slot).cast_mut().cast());
    if rc != 0 {
        // No thread is coming for it
        slot.release();
        log::debug!("pthread_create() failed: {rc}");
    }
    rc
}
