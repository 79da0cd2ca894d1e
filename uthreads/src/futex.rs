//! Thin wrappers over the Linux futex syscall, shared by the mutex's
//! guarded path and by `join`'s OneOne wait.

use std::sync::atomic::AtomicU32;

/// Blocks while `*word == expected`. Spurious wakes are expected and left
/// for the caller to re-check.
pub(crate) fn wait(word: &AtomicU32, expected: u32) {
    // Safety: `word` is a valid, live futex address for the duration of
    // this call; a mismatched value or a spurious wake both just return.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            std::ptr::from_ref(word),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wakes up to `n` waiters parked on `word`.
pub(crate) fn wake(word: &AtomicU32, n: i32) {
    // Safety: see `wait`.
    unsafe {
        libc::syscall(libc::SYS_futex, std::ptr::from_ref(word), libc::FUTEX_WAKE, n);
    }
}
