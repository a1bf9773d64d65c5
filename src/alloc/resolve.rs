//! Finding the real allocator behind us.
//!
//! `dlsym()` itself calls `calloc()`, which is us, which wants the real
//! `calloc()`, which means `dlsym()`... To break the loop, a thread that is
//! inside a lookup raises a flag, and any allocation it makes while the flag
//! is up is served from the bootstrap arena instead.

use std::{cell::Cell, ffi::CStr, marker::PhantomData, mem, num::NonZeroUsize};

use libc::c_void;
use once_cell::race::OnceNonZeroUsize;

use crate::{
    error::{fatal, ShimError},
    util::hint::cold,
};

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

/// Is the calling thread in the middle of a symbol lookup?
pub fn in_progress() -> bool {
    RESOLVING.with(Cell::get)
}

/// Raises [`RESOLVING`] for as long as it lives
struct ResolveGuard {
    previous: bool,
}

impl ResolveGuard {
    fn enter() -> Self {
        Self {
            previous: RESOLVING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        RESOLVING.with(|flag| flag.set(self.previous));
    }
}

/// `dlsym(RTLD_NEXT, name)`: the first definition of `name` after this
/// library in the lookup order
pub fn next_definition(name: &CStr) -> *mut c_void {
    // SAFETY: `name` is NUL-terminated
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
}

/// A lazily resolved function pointer of type `F`. Resolution happens at most
/// once per successful lookup and the result is kept forever. Two threads
/// racing on the first call may both look the symbol up, but they get the same
/// answer and only one is stored.
pub struct Symbol<F> {
    name: &'static CStr,
    addr: OnceNonZeroUsize,
    _fn: PhantomData<F>,
}

impl<F> Symbol<F>
where
    F: Copy,
{
    /// `F` must be an `unsafe extern "C" fn` type matching the C declaration
    /// of `name`
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            addr: OnceNonZeroUsize::new(),
            _fn: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static CStr {
        self.name
    }

    /// Has the lookup already happened?
    pub fn is_resolved(&self) -> bool {
        self.addr.get().is_some()
    }

    /// Resolve with `lookup`, which gets the symbol name. Any allocation
    /// `lookup` makes on this thread sees [`in_progress()`].
    pub fn resolve_with<L>(&self, lookup: L) -> Option<F>
    where
        L: FnOnce(&CStr) -> *mut c_void,
    {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        let addr = match self.addr.get() {
            Some(addr) => addr,
            None => cold(|| {
                self.addr.get_or_try_init(|| {
                    let _guard = ResolveGuard::enter();
                    let addr = lookup(self.name);
                    log::debug!("resolved {:?} -> {:p}", self.name, addr);
                    NonZeroUsize::new(addr as usize).ok_or(())
                })
            })
            .ok()?,
        };
        // SAFETY: `F` is a function pointer type matching the symbol, as
        // required by `new()`, and `addr` is that symbol's address
        Some(unsafe { mem::transmute_copy::<usize, F>(&addr.get()) })
    }

    /// Resolve with [`next_definition()`]
    pub fn try_get(&self) -> Option<F> {
        self.resolve_with(next_definition)
    }

    /// Like [`Symbol::try_get()`], but a missing symbol aborts the process.
    /// Calling through a null function pointer is the alternative.
    pub fn get(&self) -> F {
        match self.try_get() {
            Some(f) => f,
            None => fatal(ShimError::Unresolved(self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    type StrlenFn = unsafe extern "C" fn(*const libc::c_char) -> libc::size_t;

    #[test]
    fn next_definition_finds_libc() {
        static STRLEN: Symbol<StrlenFn> = Symbol::new(c"strlen");
        assert!(!STRLEN.is_resolved());
        let strlen = STRLEN.get();
        assert!(STRLEN.is_resolved());
        assert_eq!(unsafe { strlen(c"histalloc".as_ptr()) }, 9);
    }

    #[test]
    fn missing_symbols_stay_unresolved() {
        let symbol: Symbol<StrlenFn> = Symbol::new(c"histalloc_no_such_symbol");
        assert!(symbol.try_get().is_none());
        assert!(!symbol.is_resolved());
    }

    #[test]
    fn flag_is_raised_only_during_lookup() {
        let symbol: Symbol<StrlenFn> = Symbol::new(c"strlen");
        assert!(!in_progress());
        let f = symbol.resolve_with(|name| {
            assert!(in_progress());
            next_definition(name)
        });
        assert!(f.is_some());
        assert!(!in_progress());
    }

    #[test]
    fn lookup_runs_once_the_symbol_is_known() {
        let symbol: Symbol<StrlenFn> = Symbol::new(c"strlen");
        let mut lookups = 0;
        for _ in 0..3 {
            symbol.resolve_with(|name| {
                lookups += 1;
                next_definition(name)
            });
        }
        assert_eq!(lookups, 1);
    }

    #[test]
    fn nested_lookups_restore_the_outer_flag() {
        let outer: Symbol<StrlenFn> = Symbol::new(c"strlen");
        let inner: Symbol<StrlenFn> = Symbol::new(c"strnlen");
        outer.resolve_with(|name| {
            inner.resolve_with(|_| ptr::null_mut());
            assert!(in_progress());
            next_definition(name)
        });
        assert!(!in_progress());
    }
}
