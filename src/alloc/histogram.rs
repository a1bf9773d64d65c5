//! Allocation-size histograms.
//!
//! Each thread counts into its own [`Counts`] with no synchronization at all.
//! When the thread finishes, its counts are folded into a [`Registry`] under
//! a mutex, and the thread's histogram is released. The registry is only ever
//! read once, to dump it at process exit.
//!
//! Histograms are big (two words per possible size), so they live in their
//! own anonymous mappings rather than on the heap, which would be us, or in
//! TLS.

use std::{
    cell::Cell,
    fs::File,
    io::{self, BufWriter, Write},
    mem,
    path::Path,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    alloc::header::{current_thread, AllocationHeader},
    error::{fatal, Result, ShimError},
    os::mem::{page_size, MmapRegion},
    util::{hint::cold, num::round_up},
};

/// Sizes from `MAX_ALLOC - 1` up all land in the last bucket
pub const MAX_ALLOC: usize = 100_000;

/// The bucket `size` is counted in
pub const fn bucket(size: usize) -> usize {
    if size < MAX_ALLOC - 1 {
        size
    } else {
        MAX_ALLOC - 1
    }
}

#[repr(C)]
pub struct Counts {
    /// Number of allocations, indexed by [`bucket()`] of the requested size
    pub allocs: [usize; MAX_ALLOC],
    /// Number of blocks freed by the thread that allocated them
    pub same_thread_frees: [usize; MAX_ALLOC],
}

impl Counts {
    /// Add every bucket of `other` into `self`
    pub fn absorb(&mut self, other: &Counts) {
        for (dst, src) in self.allocs.iter_mut().zip(other.allocs.iter()) {
            *dst += *src;
        }
        for (dst, src) in self
            .same_thread_frees
            .iter_mut()
            .zip(other.same_thread_frees.iter())
        {
            *dst += *src;
        }
    }
}

/// A zeroed [`Counts`] in its own mapping
pub struct Histogram {
    region: MmapRegion,
}

impl Histogram {
    pub fn new() -> Result<Histogram> {
        Ok(Histogram {
            region: MmapRegion::map_noreserve(mem::size_of::<Counts>())?,
        })
    }

    pub fn counts(&self) -> &Counts {
        // SAFETY: The region is page-aligned, at least `size_of::<Counts>()`
        // bytes and zero-filled, which is a valid `Counts`
        unsafe { &*self.region.as_ptr().cast::<Counts>() }
    }

    pub fn counts_mut(&mut self) -> &mut Counts {
        // SAFETY: as for `counts()`, and `&mut self` makes it unique
        unsafe { &mut *self.region.as_ptr().cast::<Counts>() }
    }

    fn into_raw(self) -> NonNull<Counts> {
        let (ptr, _) = self.region.into_raw_parts();
        ptr.cast()
    }

    /// # Safety
    ///
    /// `counts` must have come from [`Histogram::into_raw()`] and not been
    /// turned back into a [`Histogram`] since
    unsafe fn from_raw(counts: NonNull<Counts>) -> Histogram {
        // Same rounding `map_noreserve()` did
        let size = round_up(mem::size_of::<Counts>(), page_size());
        Histogram {
            // SAFETY: passed to caller
            region: unsafe { MmapRegion::from_raw_parts(counts.cast(), size) },
        }
    }
}

/// Where a thread is in its life, as far as counting goes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Hasn't counted anything yet
    Uninit,
    /// Has a local histogram
    Init,
    /// Already merged. Anything counted now would never be seen, so it isn't.
    Finalized,
}

thread_local! {
    static STATE: Cell<ThreadState> = const { Cell::new(ThreadState::Uninit) };
    static LOCAL: Cell<*mut Counts> = const { Cell::new(ptr::null_mut()) };
}

/// The calling thread's [`ThreadState`]
pub fn thread_state() -> ThreadState {
    STATE.with(Cell::get)
}

/// Run `f` on the calling thread's counts, mapping them on first use
fn with_local<F>(f: F)
where
    F: FnOnce(&mut Counts),
{
    let mut counts = match thread_state() {
        ThreadState::Finalized => return,
        ThreadState::Init => LOCAL.with(Cell::get),
        ThreadState::Uninit => ptr::null_mut(),
    };
    if counts.is_null() {
        counts = cold(|| match Histogram::new() {
            Ok(histogram) => {
                let counts = histogram.into_raw().as_ptr();
                LOCAL.with(|local| local.set(counts));
                STATE.with(|state| state.set(ThreadState::Init));
                counts
            }
            Err(err) => fatal(err),
        });
    }
    // SAFETY: `LOCAL` is only ever touched by its own thread, and nothing in
    // here calls back into the histogram
    f(unsafe { &mut *counts })
}

/// Count an allocation of `size` bytes on the calling thread
pub fn record_alloc(size: usize) {
    with_local(|counts| counts.allocs[bucket(size)] += 1);
}

/// Count the release of the block described by `header`, if the calling
/// thread is the one that allocated it. Frees from other threads are exactly
/// what this histogram is meant to expose, so they don't count.
///
/// Ownership is a `pthread_t` comparison, and `pthread_t`s of exited threads
/// get reused. A block left behind by a dead thread and freed by a new thread
/// that inherited its id counts as a same-thread free.
pub fn record_same_thread_free(header: &AllocationHeader) {
    // SAFETY: always safe to call
    if unsafe { libc::pthread_equal(header.owning_thread, current_thread()) } != 0 {
        with_local(|counts| counts.same_thread_frees[bucket(header.requested_size)] += 1);
    }
}

/// Global counts of one bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub allocs: usize,
    pub same_thread_frees: usize,
}

/// The process-wide histogram, built from the counts of finished threads
pub struct Registry {
    global: Mutex<Option<Histogram>>,
}

impl Registry {
    pub const fn new() -> Registry {
        Registry {
            global: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Histogram>> {
        // Counts are plain integers, a panic mid-merge can't break them
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold the calling thread's counts into the registry and retire them.
    /// Only the first call on a thread does anything, and the thread records
    /// nothing afterwards.
    pub fn merge_current_thread(&self) {
        if thread_state() == ThreadState::Finalized {
            return;
        }
        STATE.with(|state| state.set(ThreadState::Finalized));
        let Some(local) = NonNull::new(LOCAL.with(|local| local.replace(ptr::null_mut()))) else {
            // Never allocated anything
            return;
        };
        // SAFETY: `LOCAL` only ever holds pointers from `into_raw()`, and we
        // just took it out
        let local = unsafe { Histogram::from_raw(local) };

        let mut global = self.lock();
        let Some(merged) = global.as_mut() else {
            // First one here just hands its histogram over
            *global = Some(local);
            return;
        };
        merged.counts_mut().absorb(local.counts());
        drop(global);
        // `local` is unmapped here, outside the lock
    }

    /// What has been merged into `bucket` so far
    pub fn bucket_counts(&self, bucket: usize) -> BucketCounts {
        match self.lock().as_ref() {
            Some(histogram) => BucketCounts {
                allocs: histogram.counts().allocs[bucket],
                same_thread_frees: histogram.counts().same_thread_frees[bucket],
            },
            None => BucketCounts::default(),
        }
    }

    /// Write one line per non-empty bucket, allocations first, then (if
    /// `include_frees`) same-thread frees. Buckets appear in ascending order.
    pub fn write_to<W>(&self, mut out: W, include_frees: bool) -> io::Result<()>
    where
        W: Write,
    {
        let global = self.lock();
        let Some(histogram) = global.as_ref() else {
            return Ok(());
        };
        let counts = histogram.counts();
        for (size, &n) in counts.allocs.iter().enumerate() {
            if n > 0 {
                writeln!(out, "Alloc size {size}: {n} mallocs")?;
            }
        }
        if include_frees {
            for (size, &n) in counts.same_thread_frees.iter().enumerate() {
                if n > 0 {
                    writeln!(out, "Alloc size: {size}: {n} in-thread frees")?;
                }
            }
        }
        out.flush()
    }

    /// [`Registry::write_to()`] a freshly truncated file at `path`
    pub fn dump(&self, path: &Path, include_frees: bool) -> Result<()> {
        let wrap = |source| ShimError::Dump {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(wrap)?;
        self.write_to(BufWriter::new(file), include_frees)
            .map_err(wrap)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::mpsc, thread};

    use rand::Rng;

    use super::*;
    use crate::alloc::header::HEADER_SIZE;

    /// Run `f` on a fresh thread, then merge that thread into `registry`
    fn on_fresh_thread<F>(registry: &Registry, f: F)
    where
        F: FnOnce() + Send,
    {
        thread::scope(|s| {
            s.spawn(|| {
                f();
                registry.merge_current_thread();
            });
        });
    }

    fn header_from(owning_thread: libc::pthread_t, requested_size: usize) -> AllocationHeader {
        let mut storage = [0u8; 64];
        let raw = NonNull::new(storage.as_mut_ptr()).unwrap();
        let user = unsafe { AllocationHeader::encode(raw, HEADER_SIZE, requested_size) };
        let mut header = unsafe { AllocationHeader::decode(user) };
        header.owning_thread = owning_thread;
        header
    }

    #[test]
    fn bucket_saturates_at_the_top() {
        assert_eq!(bucket(0), 0);
        assert_eq!(bucket(MAX_ALLOC - 2), MAX_ALLOC - 2);
        assert_eq!(bucket(MAX_ALLOC - 1), MAX_ALLOC - 1);
        assert_eq!(bucket(200_000), MAX_ALLOC - 1);
        assert_eq!(bucket(usize::MAX), MAX_ALLOC - 1);
    }

    #[test]
    fn large_requests_are_clamped_not_lost() {
        let registry = Registry::new();
        on_fresh_thread(&registry, || {
            record_alloc(200_000);
            record_alloc(MAX_ALLOC - 1);
        });
        assert_eq!(registry.bucket_counts(MAX_ALLOC - 1).allocs, 2);
    }

    #[test]
    fn counts_from_many_threads_add_up() {
        let registry = Registry::new();
        let sizes: Vec<usize> = {
            let mut rng = rand::thread_rng();
            (0..64).map(|_| rng.gen_range(0..MAX_ALLOC - 1)).collect()
        };
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for &size in &sizes {
                        record_alloc(size);
                    }
                    registry.merge_current_thread();
                });
            }
        })
        .unwrap();
        for &size in &sizes {
            let expected = 8 * sizes.iter().filter(|&&s| s == size).count();
            assert_eq!(registry.bucket_counts(size).allocs, expected);
        }
    }

    #[test]
    fn only_the_allocating_thread_counts_as_same_thread() {
        let registry = Registry::new();
        let (tx, rx) = mpsc::channel();
        on_fresh_thread(&registry, || {
            tx.send(current_thread()).unwrap();
            record_alloc(48);
            record_same_thread_free(&header_from(current_thread(), 48));
        });
        let other = rx.recv().unwrap();
        on_fresh_thread(&registry, || {
            record_alloc(48);
            // Allocated by the other thread, freed here
            record_same_thread_free(&header_from(other, 48));
        });
        assert_eq!(
            registry.bucket_counts(48),
            BucketCounts {
                allocs: 2,
                same_thread_frees: 1
            }
        );
    }

    #[test]
    fn merge_happens_once_and_stops_recording() {
        let registry = Registry::new();
        on_fresh_thread(&registry, || {
            record_alloc(7);
            registry.merge_current_thread();
            assert_eq!(thread_state(), ThreadState::Finalized);
            record_alloc(7);
        });
        assert_eq!(registry.bucket_counts(7).allocs, 1);
    }

    #[test]
    fn idle_threads_merge_nothing() {
        let registry = Registry::new();
        on_fresh_thread(&registry, || {
            assert_eq!(thread_state(), ThreadState::Uninit);
        });
        assert_eq!(registry.bucket_counts(0), BucketCounts::default());
    }

    #[test]
    fn dump_lists_non_empty_buckets_in_order() {
        let registry = Registry::new();
        on_fresh_thread(&registry, || {
            record_alloc(64);
            record_alloc(8);
            record_alloc(8);
            record_same_thread_free(&header_from(current_thread(), 8));
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".histalloc.dat");

        registry.dump(&path, true).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Alloc size 8: 2 mallocs\n\
             Alloc size 64: 1 mallocs\n\
             Alloc size: 8: 1 in-thread frees\n"
        );

        registry.dump(&path, false).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Alloc size 8: 2 mallocs\nAlloc size 64: 1 mallocs\n"
        );
    }

    #[test]
    fn empty_registry_dumps_an_empty_file() {
        let registry = Registry::new();
        let mut out = Vec::new();
        registry.write_to(&mut out, true).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unwritable_dump_path_is_an_error() {
        let registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(".histalloc.dat");
        match registry.dump(&path, true) {
            Err(ShimError::Dump { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected a dump error, got {other:?}"),
        }
    }
}
