//! The hidden per-allocation header.
//!
//! Every block handed out while free tracking is on looks like this:
//!
//! ```text
//! +--------------------+ <- raw_block (what the real allocator returned)
//! | padding...         |
//! |                    | offset - HEADER_SIZE bytes (0 unless over-aligned)
//! +--------------------+
//! | AllocationHeader   | HEADER_SIZE bytes
//! +--------------------+ <- raw_block + offset (what the caller gets)
//! | requested_size     |
//! | bytes              |
//! +--------------------+
//! ```
//!
//! The header always sits immediately before the user pointer and remembers
//! where the raw block starts, so `decode()` never has to guess the offset.

use std::{
    mem,
    ptr::{self, NonNull},
};

use libc::pthread_t;

/// What `malloc()` promises on every platform we care about
pub const MIN_ALIGN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct AllocationHeader {
    /// `pthread_self()` of the thread that made (or last moved) the block
    pub owning_thread: pthread_t,
    /// The size the caller asked for, header not included
    pub requested_size: usize,
    /// Start of the block the real allocator handed out
    raw_block: *mut u8,
}

pub const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

const _: () = assert!(HEADER_SIZE % mem::size_of::<usize>() == 0);
const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(HEADER_SIZE.is_power_of_two());

/// `pthread_self()`
pub fn current_thread() -> pthread_t {
    // SAFETY: always safe to call
    unsafe { libc::pthread_self() }
}

impl AllocationHeader {
    /// Distance from the raw block to the user pointer for an allocation that
    /// must be aligned to `align`. This is the smallest multiple of
    /// [`HEADER_SIZE`] that is also a multiple of `align`, so the user pointer
    /// keeps whatever alignment the raw block had, and the header fits in the
    /// padding before it.
    ///
    /// Alignments that aren't a power of two are rounded up to one, the way
    /// glibc's `memalign()` treats them. `None` if that would overflow.
    pub const fn offset_for(align: usize) -> Option<usize> {
        let align = match align.checked_next_power_of_two() {
            Some(align) => align,
            None => return None,
        };
        // Both are powers of two, so the larger is a multiple of the smaller
        if align > HEADER_SIZE {
            Some(align)
        } else {
            Some(HEADER_SIZE)
        }
    }

    /// Start of the block the real allocator returned
    pub const fn raw_block(&self) -> *mut u8 {
        self.raw_block
    }

    /// How far `user` is from the start of its raw block
    pub fn offset_of(&self, user: NonNull<u8>) -> usize {
        user.as_ptr() as usize - self.raw_block as usize
    }

    /// Write a header for the calling thread into `raw` and return the
    /// pointer the caller should see, `offset` bytes in.
    ///
    /// # Safety
    ///
    /// - `raw` must be valid for writes of at least `offset` bytes
    /// - `offset` must be at least [`HEADER_SIZE`]
    pub unsafe fn encode(raw: NonNull<u8>, offset: usize, requested_size: usize) -> NonNull<u8> {
        debug_assert!(offset >= HEADER_SIZE);
        let header = AllocationHeader {
            owning_thread: current_thread(),
            requested_size,
            raw_block: raw.as_ptr(),
        };
        // SAFETY: `offset` is within the block, as promised by the caller,
        // and an in-bounds offset from a non-null pointer is non-null
        let user = unsafe { NonNull::new_unchecked(raw.as_ptr().add(offset)) };
        // SAFETY:
        // - `offset >= HEADER_SIZE`, so the header lies entirely inside the
        //   block
        // - The real allocator only promises its own alignment, which may be
        //   less than ours on exotic platforms, so don't rely on it
        unsafe {
            user.as_ptr()
                .sub(HEADER_SIZE)
                .cast::<AllocationHeader>()
                .write_unaligned(header)
        };
        user
    }

    /// Read the header hidden before `user`.
    ///
    /// # Safety
    ///
    /// `user` must have been returned by [`AllocationHeader::encode()`] and
    /// not released since.
    pub unsafe fn decode(user: NonNull<u8>) -> AllocationHeader {
        // SAFETY: `encode()` put a header exactly here
        unsafe {
            ptr::read_unaligned(
                user.as_ptr()
                    .sub(HEADER_SIZE)
                    .cast::<AllocationHeader>(),
            )
        }
    }
}
