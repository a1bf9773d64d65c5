//! A bump allocator over a static arena, for the allocations that
//! `dlsym()` makes while we are still looking up the real `calloc()`.
//!
//! `free()` is a nop and `alloc()` is just a cursor bump. Every block is
//! preceded by one [`MIN_ALIGN`] slot holding its requested size, which is all
//! `realloc()` needs to move a block out of here.

use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alloc::header::MIN_ALIGN,
    error::{fatal, Result, ShimError},
    util::num::checked_round_up,
};

/// 1 MiB, far more than `dlsym()` ever wants
pub const BOOTSTRAP_CAPACITY: usize = 0x100000;

const PREFIX: usize = MIN_ALIGN;

#[repr(C, align(16))]
struct Bytes<const N: usize>([u8; N]);

pub struct BootstrapArena<const N: usize = BOOTSTRAP_CAPACITY> {
    bytes: UnsafeCell<Bytes<N>>,
    cursor: AtomicUsize,
}

// SAFETY: Blocks are carved out with an atomic bump, so no byte is ever
// handed to two callers
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new(Bytes([0; N])),
            cursor: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.bytes.get().cast()
    }

    /// Bump-allocate `count * size` zeroed bytes, aligned to [`MIN_ALIGN`].
    /// Returns null if `count * size` overflows.
    pub fn try_alloc(&self, count: usize, size: usize) -> Result<*mut u8> {
        let Some(requested) = count.checked_mul(size) else {
            return Ok(ptr::null_mut());
        };
        let span = requested
            .checked_add(PREFIX)
            .and_then(|span| checked_round_up(span, MIN_ALIGN))
            .unwrap_or(usize::MAX);

        let mut start = self.cursor.load(Ordering::Relaxed);
        loop {
            let remaining = N - start;
            if span > remaining {
                return Err(ShimError::ArenaExhausted {
                    requested,
                    remaining,
                });
            }
            match self.cursor.compare_exchange_weak(
                start,
                start + span,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }

        // SAFETY:
        // - `start + span <= N`, so the whole block is inside the arena
        // - Nobody else can be handed these bytes, the cursor has moved past
        //   them
        // - The arena is never reused, so the bytes are still zero
        unsafe {
            let block = self.base().add(start);
            block.cast::<usize>().write(requested);
            Ok(block.add(PREFIX))
        }
    }

    /// [`BootstrapArena::try_alloc()`], aborting the process when the arena is
    /// exhausted. There is nothing to fall back on.
    pub fn alloc(&self, count: usize, size: usize) -> *mut u8 {
        match self.try_alloc(count, size) {
            Ok(data) => data,
            Err(err) => fatal(err),
        }
    }

    /// Does `ptr` point into this arena?
    pub fn owns<T>(&self, ptr: *const T) -> bool {
        let base = self.base() as usize;
        (base..base + N).contains(&(ptr as usize))
    }

    /// The requested size of a block
    ///
    /// # Safety
    ///
    /// `data` must have been returned by this arena
    pub unsafe fn size_of(&self, data: *const u8) -> usize {
        debug_assert!(self.owns(data));
        // SAFETY: `try_alloc()` wrote the size just before the block
        unsafe { data.sub(PREFIX).cast::<usize>().read() }
    }

    /// Bytes consumed so far, prefixes and padding included
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
