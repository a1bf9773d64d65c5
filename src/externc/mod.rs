use libc::{c_int, c_void, pthread_attr_t, pthread_t, size_t};

use crate::{
    lifecycle::{self, INTERPOSER, PTHREAD_CREATE, TRAMPOLINES},
    os::thread::{spawn_through, StartRoutine},
};

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    INTERPOSER.malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    INTERPOSER.free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(n: size_t, size: size_t) -> *mut c_void {
    INTERPOSER.calloc(n, size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    INTERPOSER.realloc(ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    INTERPOSER.posix_memalign(out, align, size)
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    INTERPOSER.aligned_alloc(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    INTERPOSER.memalign(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    INTERPOSER.valloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    INTERPOSER.pvalloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    INTERPOSER.malloc_usable_size(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    spawn_through(&TRAMPOLINES, PTHREAD_CREATE.get(), thread, attr, start, arg)
}

#[ctor::ctor]
fn initializer() {
    lifecycle::process_initialize();
}

#[ctor::dtor]
fn finalizer() {
    lifecycle::process_finalize();
}
