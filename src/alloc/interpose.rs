//! The instrumented allocation family.
//!
//! [`Interposer`] wraps some [`RawAllocator`] (in production, whatever
//! `dlsym(RTLD_NEXT, ..)` finds, see [`NextSymbols`]) and every entry point
//! has the same shape: count the request, grow it by room for an
//! [`AllocationHeader`], forward it, then stamp the header and hand out the
//! pointer just past it. `free()` undoes this.
//!
//! With [`Tracking::CountsOnly`] the header part is skipped and pointers go
//! through untouched.

use std::{
    cmp,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, Ordering},
};

use libc::{c_int, c_void, size_t, EINVAL, ENOMEM};

use crate::{
    alloc::{
        bootstrap::{BootstrapArena, BOOTSTRAP_CAPACITY},
        header::{AllocationHeader, HEADER_SIZE},
        histogram,
        resolve::{self, Symbol},
    },
    config::{self, Tracking},
    error::{Result, ShimError},
    os::mem::{page_size, set_errno},
    util::hint::cold,
};

/// The C allocation family, as some allocator implements it.
///
/// # Safety
///
/// Implementations must behave like their C namesakes: returned blocks are
/// at least as big and as aligned as requested and stay valid until released
/// through the same implementation.
pub unsafe trait RawAllocator {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void;
    unsafe fn free(&self, ptr: *mut c_void);
    unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void;
    unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: size_t, size: size_t) -> c_int;
    unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void;
    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void;
    unsafe fn valloc(&self, size: size_t) -> *mut c_void;
    unsafe fn pvalloc(&self, size: size_t) -> *mut c_void;
    unsafe fn malloc_usable_size(&self, ptr: *mut c_void) -> size_t;
}

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;
pub type AlignedFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> size_t;

/// The allocator that comes after us in symbol lookup order, usually libc's.
/// Each function is looked up the first time it's needed.
pub struct NextSymbols {
    malloc: Symbol<MallocFn>,
    free: Symbol<FreeFn>,
    calloc: Symbol<CallocFn>,
    realloc: Symbol<ReallocFn>,
    posix_memalign: Symbol<PosixMemalignFn>,
    aligned_alloc: Symbol<AlignedFn>,
    memalign: Symbol<AlignedFn>,
    valloc: Symbol<MallocFn>,
    pvalloc: Symbol<MallocFn>,
    malloc_usable_size: Symbol<UsableSizeFn>,
}

impl NextSymbols {
    pub const fn new() -> Self {
        Self {
            malloc: Symbol::new(c"malloc"),
            free: Symbol::new(c"free"),
            calloc: Symbol::new(c"calloc"),
            realloc: Symbol::new(c"realloc"),
            posix_memalign: Symbol::new(c"posix_memalign"),
            aligned_alloc: Symbol::new(c"aligned_alloc"),
            memalign: Symbol::new(c"memalign"),
            valloc: Symbol::new(c"valloc"),
            pvalloc: Symbol::new(c"pvalloc"),
            malloc_usable_size: Symbol::new(c"malloc_usable_size"),
        }
    }

    /// Look up everything a process can't run without. Anything else is
    /// resolved on first use.
    pub fn resolve_required(&self) -> Result<()> {
        self.malloc
            .try_get()
            .ok_or(ShimError::Unresolved(self.malloc.name()))?;
        self.free
            .try_get()
            .ok_or(ShimError::Unresolved(self.free.name()))?;
        self.calloc
            .try_get()
            .ok_or(ShimError::Unresolved(self.calloc.name()))?;
        self.realloc
            .try_get()
            .ok_or(ShimError::Unresolved(self.realloc.name()))?;
        Ok(())
    }
}

impl Default for NextSymbols {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawAllocator for NextSymbols {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        (self.malloc.get())(size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.free.get())(ptr)
    }

    unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        (self.calloc.get())(n, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        (self.realloc.get())(ptr, size)
    }

    unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: size_t, size: size_t) -> c_int {
        (self.posix_memalign.get())(out, align, size)
    }

    unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        (self.aligned_alloc.get())(align, size)
    }

    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        (self.memalign.get())(align, size)
    }

    unsafe fn valloc(&self, size: size_t) -> *mut c_void {
        (self.valloc.get())(size)
    }

    unsafe fn pvalloc(&self, size: size_t) -> *mut c_void {
        (self.pvalloc.get())(size)
    }

    unsafe fn malloc_usable_size(&self, ptr: *mut c_void) -> size_t {
        (self.malloc_usable_size.get())(ptr)
    }
}

const UNLATCHED: u8 = 0;

pub struct Interposer<B, const N: usize = BOOTSTRAP_CAPACITY> {
    backend: B,
    bootstrap: BootstrapArena<N>,
    tracking: AtomicU8,
}

impl<B, const N: usize> Interposer<B, N>
where
    B: RawAllocator,
{
    /// An interposer that reads its [`Tracking`] mode from [`config::get()`]
    /// on first use
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            bootstrap: BootstrapArena::new(),
            tracking: AtomicU8::new(UNLATCHED),
        }
    }

    pub const fn with_tracking(backend: B, tracking: Tracking) -> Self {
        Self {
            backend,
            bootstrap: BootstrapArena::new(),
            tracking: AtomicU8::new(tracking as u8),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn bootstrap(&self) -> &BootstrapArena<N> {
        &self.bootstrap
    }

    /// The mode every call uses. Fixed the first time it is asked for, so a
    /// `free()` always agrees with the `malloc()` that made its pointer.
    pub fn tracking(&self) -> Tracking {
        match Tracking::from_u8(self.tracking.load(Ordering::Relaxed)) {
            Some(tracking) => tracking,
            None => cold(|| {
                let wanted = config::get().tracking;
                match self.tracking.compare_exchange(
                    UNLATCHED,
                    wanted as u8,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => wanted,
                    Err(latched) => Tracking::from_u8(latched).unwrap_or(wanted),
                }
            }),
        }
    }

    /// Forward a request for `size` bytes as `size + offset` bytes and put a
    /// header in front of what comes back
    unsafe fn with_header<F>(&self, size: usize, offset: usize, forward: F) -> *mut c_void
    where
        F: FnOnce(usize) -> *mut c_void,
    {
        let Some(total) = size.checked_add(offset) else {
            set_errno(ENOMEM);
            return ptr::null_mut();
        };
        match NonNull::new(forward(total).cast::<u8>()) {
            // SAFETY: the backend gave us at least `total >= offset` bytes
            Some(raw) => unsafe { AllocationHeader::encode(raw, offset, size) }
                .as_ptr()
                .cast(),
            None => ptr::null_mut(),
        }
    }

    /// [`Interposer::with_header()`] for the aligned family. Alignments too
    /// big to pad for fail the way an impossible request would.
    unsafe fn with_aligned_header<F>(&self, align: usize, size: usize, forward: F) -> *mut c_void
    where
        F: FnOnce(usize) -> *mut c_void,
    {
        match AllocationHeader::offset_for(align) {
            // SAFETY: passed to caller
            Some(offset) => unsafe { self.with_header(size, offset, forward) },
            None => {
                set_errno(ENOMEM);
                ptr::null_mut()
            }
        }
    }

    pub unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        if resolve::in_progress() {
            return cold(|| self.bootstrap.alloc(1, size).cast::<c_void>());
        }
        histogram::record_alloc(size);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.malloc(size),
            Tracking::SameThreadFrees => {
                self.with_header(size, HEADER_SIZE, |total| self.backend.malloc(total))
            }
        };
        log::trace!("malloc({size}) -> {ptr:p}");
        ptr
    }

    pub unsafe fn free(&self, ptr: *mut c_void) {
        if self.bootstrap.owns(ptr) {
            log::trace!("free({ptr:p}): bootstrap block, ignored");
            return;
        }
        let Some(user) = NonNull::new(ptr.cast::<u8>()) else {
            return self.backend.free(ptr);
        };
        log::trace!("free({ptr:p})");
        match self.tracking() {
            Tracking::CountsOnly => self.backend.free(ptr),
            Tracking::SameThreadFrees => {
                // SAFETY: every non-bootstrap pointer we hand out in this mode
                // has a header
                let header = unsafe { AllocationHeader::decode(user) };
                histogram::record_same_thread_free(&header);
                self.backend.free(header.raw_block().cast());
            }
        }
    }

    pub unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        if resolve::in_progress() {
            // This is the call `dlsym()` makes while we look up `calloc()`
            return cold(|| self.bootstrap.alloc(n, size).cast::<c_void>());
        }
        let Some(requested) = n.checked_mul(size) else {
            set_errno(ENOMEM);
            return ptr::null_mut();
        };
        histogram::record_alloc(requested);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.calloc(n, size),
            // One element covering the user's elements and the header
            Tracking::SameThreadFrees => self.with_header(requested, HEADER_SIZE, |total| {
                self.backend.calloc(1, total)
            }),
        };
        log::trace!("calloc({n}, {size}) -> {ptr:p}");
        ptr
    }

    pub unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        let Some(user) = NonNull::new(ptr.cast::<u8>()) else {
            return self.malloc(size);
        };
        if size == 0 {
            // Still a request, even though nothing comes back
            histogram::record_alloc(0);
            log::trace!("realloc({ptr:p}, 0): freeing");
            self.free(ptr);
            return ptr::null_mut();
        }
        if self.bootstrap.owns(ptr) {
            return cold(|| self.realloc_from_bootstrap(user, size));
        }
        histogram::record_alloc(size);
        let new = match self.tracking() {
            Tracking::CountsOnly => self.backend.realloc(ptr, size),
            Tracking::SameThreadFrees => self.realloc_with_header(user, size),
        };
        log::trace!("realloc({ptr:p}, {size}) -> {new:p}");
        new
    }

    unsafe fn realloc_with_header(&self, user: NonNull<u8>, size: usize) -> *mut c_void {
        // SAFETY: a live, non-bootstrap pointer from us, so it has a header
        let header = unsafe { AllocationHeader::decode(user) };
        let old_offset = header.offset_of(user);
        // Keep the old offset for the move, the data is still there after
        // `realloc()`
        let Some(total) = size.checked_add(old_offset) else {
            set_errno(ENOMEM);
            return ptr::null_mut();
        };
        let Some(raw) = NonNull::new(
            self.backend
                .realloc(header.raw_block().cast(), total)
                .cast::<u8>(),
        ) else {
            // The old block is untouched, header included
            return ptr::null_mut();
        };
        if old_offset != HEADER_SIZE {
            // An aligned block. The new one only promises malloc alignment, so
            // slide the data down to where a plain header puts it.
            // SAFETY: both ranges are inside the `size + old_offset` bytes we
            // asked for
            unsafe {
                ptr::copy(
                    raw.as_ptr().add(old_offset),
                    raw.as_ptr().add(HEADER_SIZE),
                    cmp::min(header.requested_size, size),
                )
            };
        }
        // SAFETY: `total >= HEADER_SIZE`
        unsafe { AllocationHeader::encode(raw, HEADER_SIZE, size) }
            .as_ptr()
            .cast()
    }

    /// Bootstrap blocks can't grow in place, so move them to the real heap
    unsafe fn realloc_from_bootstrap(&self, user: NonNull<u8>, size: usize) -> *mut c_void {
        // SAFETY: `owns()` said so
        let old_size = unsafe { self.bootstrap.size_of(user.as_ptr()) };
        let new = self.malloc(size);
        if !new.is_null() {
            // SAFETY: `new` has room for `size` bytes and the bootstrap block
            // for `old_size`. They can't overlap.
            unsafe {
                ptr::copy_nonoverlapping(
                    user.as_ptr(),
                    new.cast::<u8>(),
                    cmp::min(old_size, size),
                )
            };
        }
        log::trace!("realloc({:p}, {size}) -> {new:p}: moved off bootstrap", user);
        new
    }

    pub unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: size_t, size: size_t) -> c_int {
        if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
            return EINVAL;
        }
        histogram::record_alloc(size);
        let rc = match self.tracking() {
            Tracking::CountsOnly => self.backend.posix_memalign(out, align, size),
            Tracking::SameThreadFrees => {
                let mut rc = 0;
                let ptr = self.with_aligned_header(align, size, |total| {
                    let mut raw = ptr::null_mut();
                    rc = self.backend.posix_memalign(&mut raw, align, total);
                    if rc == 0 {
                        raw
                    } else {
                        ptr::null_mut()
                    }
                });
                match (rc, ptr.is_null()) {
                    (0, false) => {
                        // SAFETY: `out` is valid for writes, as for the real
                        // `posix_memalign()`
                        unsafe { out.write(ptr) };
                        0
                    }
                    // Overflowed before reaching the backend
                    (0, true) => ENOMEM,
                    (rc, _) => rc,
                }
            }
        };
        log::trace!("posix_memalign({align}, {size}) -> {rc}");
        rc
    }

    pub unsafe fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        histogram::record_alloc(size);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.aligned_alloc(align, size),
            Tracking::SameThreadFrees => self.with_aligned_header(align, size, |total| {
                self.backend.aligned_alloc(align, total)
            }),
        };
        log::trace!("aligned_alloc({align}, {size}) -> {ptr:p}");
        ptr
    }

    pub unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        histogram::record_alloc(size);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.memalign(align, size),
            Tracking::SameThreadFrees => self.with_aligned_header(align, size, |total| {
                self.backend.memalign(align, total)
            }),
        };
        log::trace!("memalign({align}, {size}) -> {ptr:p}");
        ptr
    }

    pub unsafe fn valloc(&self, size: size_t) -> *mut c_void {
        histogram::record_alloc(size);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.valloc(size),
            Tracking::SameThreadFrees => {
                self.with_aligned_header(page_size(), size, |total| self.backend.valloc(total))
            }
        };
        log::trace!("valloc({size}) -> {ptr:p}");
        ptr
    }

    pub unsafe fn pvalloc(&self, size: size_t) -> *mut c_void {
        histogram::record_alloc(size);
        let ptr = match self.tracking() {
            Tracking::CountsOnly => self.backend.pvalloc(size),
            Tracking::SameThreadFrees => {
                self.with_aligned_header(page_size(), size, |total| self.backend.pvalloc(total))
            }
        };
        log::trace!("pvalloc({size}) -> {ptr:p}");
        ptr
    }

    /// Bytes the caller may use at `ptr`. Never counted.
    pub unsafe fn malloc_usable_size(&self, ptr: *mut c_void) -> size_t {
        let Some(user) = NonNull::new(ptr.cast::<u8>()) else {
            return 0;
        };
        if self.bootstrap.owns(ptr) {
            // SAFETY: `owns()` said so
            return unsafe { self.bootstrap.size_of(user.as_ptr()) };
        }
        match self.tracking() {
            Tracking::CountsOnly => self.backend.malloc_usable_size(ptr),
            Tracking::SameThreadFrees => {
                // SAFETY: as for `free()`
                let header = unsafe { AllocationHeader::decode(user) };
                self.backend
                    .malloc_usable_size(header.raw_block().cast())
                    .saturating_sub(header.offset_of(user))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{slice, sync::Once};

    use super::*;
    use crate::{
        alloc::{header::current_thread, resolve::next_definition},
        util::num::aligned_to,
    };

    type Shim = Interposer<NextSymbols, 4096>;

    fn init_logging() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn shim(tracking: Tracking) -> Box<Shim> {
        init_logging();
        Box::new(Interposer::with_tracking(NextSymbols::new(), tracking))
    }

    /// Everything fails, the way a real allocator does when out of memory
    struct OutOfMemory;

    unsafe impl RawAllocator for OutOfMemory {
        unsafe fn malloc(&self, _: size_t) -> *mut c_void {
            set_errno(ENOMEM);
            ptr::null_mut()
        }
        unsafe fn free(&self, _: *mut c_void) {}
        unsafe fn calloc(&self, _: size_t, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn realloc(&self, _: *mut c_void, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn posix_memalign(&self, _: *mut *mut c_void, _: size_t, _: size_t) -> c_int {
            ENOMEM
        }
        unsafe fn aligned_alloc(&self, _: size_t, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn memalign(&self, _: size_t, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn valloc(&self, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn pvalloc(&self, _: size_t) -> *mut c_void {
            self.malloc(0)
        }
        unsafe fn malloc_usable_size(&self, _: *mut c_void) -> size_t {
            0
        }
    }

    fn fill(ptr: *mut c_void, len: usize) {
        for (i, byte) in unsafe { slice::from_raw_parts_mut(ptr.cast::<u8>(), len) }
            .iter_mut()
            .enumerate()
        {
            *byte = i as u8;
        }
    }

    fn check(ptr: *mut c_void, len: usize) {
        let bytes = unsafe { slice::from_raw_parts(ptr.cast::<u8>(), len) };
        for (i, &byte) in bytes.iter().enumerate() {
            assert_eq!(byte, i as u8, "byte {i} moved");
        }
    }

    #[test]
    fn required_symbols_resolve() {
        assert!(NextSymbols::new().resolve_required().is_ok());
    }

    #[test]
    fn malloc_hides_a_header_for_the_calling_thread() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            let ptr = shim.malloc(100);
            assert!(aligned_to(ptr as usize, 16));
            let header = AllocationHeader::decode(NonNull::new(ptr.cast()).unwrap());
            assert_eq!(header.requested_size, 100);
            assert_eq!(header.owning_thread, current_thread());
            assert_eq!(header.offset_of(NonNull::new(ptr.cast()).unwrap()), HEADER_SIZE);
            assert!(shim.malloc_usable_size(ptr) >= 100);
            fill(ptr, 100);
            shim.free(ptr);
        }
    }

    #[test]
    fn calloc_zeroes_the_user_bytes() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            let ptr = shim.calloc(10, 12);
            assert!(!ptr.is_null());
            assert!(slice::from_raw_parts(ptr.cast::<u8>(), 120)
                .iter()
                .all(|&b| b == 0));
            shim.free(ptr);
        }
    }

    #[test]
    fn calloc_overflow_is_enomem() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            assert!(shim.calloc(usize::MAX, 2).is_null());
            assert_eq!(crate::os::mem::errno(), ENOMEM);
            assert!(shim.malloc(usize::MAX - 1).is_null());
            assert_eq!(crate::os::mem::errno(), ENOMEM);
        }
    }

    #[test]
    fn nested_calloc_during_resolution_uses_the_bootstrap_arena() {
        let shim = shim(Tracking::SameThreadFrees);
        let calloc: Symbol<CallocFn> = Symbol::new(c"calloc");
        let mut nested = ptr::null_mut();
        let resolved = calloc.resolve_with(|name| {
            // What `dlsym()` does to us
            nested = unsafe { shim.calloc(4, 8) };
            next_definition(name)
        });
        assert!(resolved.is_some());
        assert!(shim.bootstrap().owns(nested));
        assert_eq!(unsafe { shim.bootstrap().size_of(nested.cast::<u8>()) }, 32);
        unsafe {
            assert_eq!(shim.malloc_usable_size(nested), 32);
            // A nop, not a trip into the real `free()`
            shim.free(nested);
            // Once resolution is over we are back on the real heap
            let ptr = shim.calloc(4, 8);
            assert!(!shim.bootstrap().owns(ptr));
            shim.free(ptr);
        }
    }

    #[test]
    fn realloc_moves_bootstrap_blocks_to_the_heap() {
        let shim = shim(Tracking::SameThreadFrees);
        let symbol: Symbol<MallocFn> = Symbol::new(c"malloc");
        let mut nested = ptr::null_mut();
        symbol.resolve_with(|name| {
            nested = unsafe { shim.malloc(24) };
            next_definition(name)
        });
        assert!(shim.bootstrap().owns(nested));
        fill(nested, 24);
        unsafe {
            let moved = shim.realloc(nested, 64);
            assert!(!shim.bootstrap().owns(moved));
            check(moved, 24);
            shim.free(moved);
        }
    }

    #[test]
    fn aligned_entry_points_honour_alignment() {
        let shim = shim(Tracking::SameThreadFrees);
        for align in [8, 16, 64, 256, 4096] {
            for size in [0, 1, 33, 4097] {
                unsafe {
                    let mut ptr = ptr::null_mut();
                    assert_eq!(shim.posix_memalign(&mut ptr, align, size), 0);
                    let aligned = shim.aligned_alloc(align, size.max(align) / align * align);
                    let memaligned = shim.memalign(align, size);
                    for ptr in [ptr, aligned, memaligned] {
                        assert!(aligned_to(ptr as usize, align), "{ptr:p} for {align}");
                        let header = AllocationHeader::decode(NonNull::new(ptr.cast()).unwrap());
                        // The header is entirely inside the real block
                        assert!(header.raw_block() as usize + HEADER_SIZE <= ptr as usize);
                        fill(ptr, size);
                        shim.free(ptr);
                    }
                }
            }
        }
    }

    #[test]
    fn page_aligned_entry_points_return_page_aligned_blocks() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            for ptr in [shim.valloc(10), shim.pvalloc(5000)] {
                assert!(aligned_to(ptr as usize, page_size()));
                let header = AllocationHeader::decode(NonNull::new(ptr.cast()).unwrap());
                assert_eq!(header.offset_of(NonNull::new(ptr.cast()).unwrap()), page_size());
                shim.free(ptr);
            }
        }
    }

    #[test]
    fn posix_memalign_rejects_bad_alignments() {
        let shim = shim(Tracking::SameThreadFrees);
        let mut ptr = ptr::null_mut();
        unsafe {
            assert_eq!(shim.posix_memalign(&mut ptr, 24, 8), EINVAL);
            assert_eq!(shim.posix_memalign(&mut ptr, 4, 8), EINVAL);
        }
        assert!(ptr.is_null());
    }

    #[test]
    fn realloc_keeps_data_and_retakes_ownership() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            let ptr = shim.malloc(40);
            fill(ptr, 40);
            let grown = shim.realloc(ptr, 4000);
            check(grown, 40);
            let header = AllocationHeader::decode(NonNull::new(grown.cast()).unwrap());
            assert_eq!(header.requested_size, 4000);
            assert_eq!(header.owning_thread, current_thread());

            let shrunk = shim.realloc(grown, 10);
            check(shrunk, 10);
            shim.free(shrunk);
        }
    }

    #[test]
    fn realloc_of_an_aligned_block_slides_the_data_down() {
        let shim = shim(Tracking::SameThreadFrees);
        unsafe {
            let ptr = shim.memalign(256, 100);
            fill(ptr, 100);
            let moved = shim.realloc(ptr, 300);
            let header = AllocationHeader::decode(NonNull::new(moved.cast()).unwrap());
            assert_eq!(header.offset_of(NonNull::new(moved.cast()).unwrap()), HEADER_SIZE);
            check(moved, 100);
            shim.free(moved);
        }
    }

    #[test]
    fn realloc_edge_cases_match_glibc() {
        let registry = histogram::Registry::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                let shim = shim(Tracking::SameThreadFrees);
                unsafe {
                    let fresh = shim.realloc(ptr::null_mut(), 16);
                    assert!(!fresh.is_null());
                    assert!(shim.realloc(fresh, 0).is_null());
                }
                registry.merge_current_thread();
            });
        });
        // The shrink to nothing is counted as a request for 0 bytes, and
        // releases the block on the thread that made it
        assert_eq!(registry.bucket_counts(0).allocs, 1);
        assert_eq!(
            registry.bucket_counts(16),
            histogram::BucketCounts {
                allocs: 1,
                same_thread_frees: 1
            }
        );
    }

    #[test]
    fn backend_failures_pass_straight_through() {
        init_logging();
        let shim = Box::new(Interposer::<_, 256>::with_tracking(
            OutOfMemory,
            Tracking::SameThreadFrees,
        ));
        unsafe {
            assert!(shim.malloc(8).is_null());
            assert!(shim.calloc(2, 8).is_null());
            assert!(shim.aligned_alloc(64, 64).is_null());
            assert!(shim.memalign(64, 8).is_null());
            assert!(shim.valloc(8).is_null());
            assert!(shim.pvalloc(8).is_null());
            let mut out = ptr::null_mut();
            assert_eq!(shim.posix_memalign(&mut out, 64, 8), ENOMEM);
            assert!(out.is_null());
            shim.free(ptr::null_mut());
        }
    }

    #[test]
    fn counts_only_hands_out_raw_pointers() {
        let shim = shim(Tracking::CountsOnly);
        assert_eq!(shim.tracking(), Tracking::CountsOnly);
        unsafe {
            let ptr = shim.malloc(64);
            let real_usable = (shim.backend().malloc_usable_size.get())(ptr);
            assert_eq!(shim.malloc_usable_size(ptr), real_usable);
            let ptr = shim.realloc(ptr, 128);
            fill(ptr, 128);
            shim.free(ptr);

            let mut aligned = ptr::null_mut();
            assert_eq!(shim.posix_memalign(&mut aligned, 4096, 10), 0);
            assert!(aligned_to(aligned as usize, 4096));
            shim.free(aligned);
        }
    }

    #[test]
    fn allocations_are_counted_by_requested_size() {
        let registry = histogram::Registry::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                let shim = shim(Tracking::SameThreadFrees);
                unsafe {
                    let a = shim.malloc(4321);
                    let b = shim.calloc(3, 1441);
                    shim.free(a);
                    shim.free(b);
                }
                registry.merge_current_thread();
            });
        });
        let counts = registry.bucket_counts(4321);
        assert_eq!(counts.allocs, 1);
        assert_eq!(counts.same_thread_frees, 1);
        assert_eq!(registry.bucket_counts(3 * 1441).allocs, 1);
    }
}
