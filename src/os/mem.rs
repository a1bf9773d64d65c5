use std::{num::NonZeroUsize, ptr::NonNull};

use libc::{
    __errno_location, mmap, munmap, EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM, MAP_ANONYMOUS,
    MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use once_cell::race::OnceNonZeroUsize;

use crate::{
    error::{Result, ShimError},
    util::num::round_up,
};

static PAGE_SIZE: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// The system page size. `sysconf()` is only asked once.
pub fn page_size() -> usize {
    PAGE_SIZE
        .get_or_init(|| NonZeroUsize::new(page_size::get()).unwrap_or(NonZeroUsize::MIN))
        .get()
}

/// The calling thread's `errno`
pub fn errno() -> i32 {
    // SAFETY: `__errno_location()` always returns a valid thread-local pointer
    unsafe { *__errno_location() }
}

pub fn set_errno(value: i32) {
    // SAFETY: as for `errno()`
    unsafe { *__errno_location() = value }
}

/// Name of the errnos `mmap()` can actually give us
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        ENOMEM => "ENOMEM", // It's basically just this one
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        _ => "unknown",
    }
}

/// An anonymous, private, read/write mapping that is unmapped on drop. Pages
/// are zero-filled by the kernel and only backed once they are touched, so a
/// mostly-empty histogram costs next to nothing.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: The region is exclusively owned, like a `Box<[u8]>`
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of at least `size` bytes.
    /// This is guaranteed to map at least 1 page. Never touches the allocator.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion> {
        let size = round_up(size.max(1), page_size());
        // SAFETY: An anonymous mapping with no address hint can't alias
        // anything we already own
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(ShimError::MapFailed {
                size,
                errno: errno_name(errno()),
            });
        }
        match NonNull::new(ptr.cast::<u8>()) {
            Some(ptr) => Ok(MmapRegion { ptr, size }),
            None => Err(ShimError::MapFailed {
                size,
                errno: "null mapping",
            }),
        }
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping, always a whole number of pages
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Give up ownership without unmapping
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let parts = (self.ptr, self.size);
        std::mem::forget(self);
        parts
    }

    /// # Safety
    ///
    /// `ptr` and `size` must have come from [`MmapRegion::into_raw_parts()`],
    /// and the region must not be owned by anybody else.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> MmapRegion {
        MmapRegion { ptr, size }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size. This is true
        //   because we can only construct this region as page-aligned
        // - We requested a region of exactly `self.size` bytes and never
        //   changed it.
        unsafe {
            munmap(self.ptr.as_ptr().cast(), self.size);
        }
    }
}
