/// Mark some stuff as `#[cold]`. Everything off the allocation fast path
/// (symbol lookup, mapping a histogram, bootstrap routing) goes through here.
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
