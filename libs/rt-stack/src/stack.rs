//! Guarded stack allocation for user-mode thread carriers.
//!
//! Stacks are reserved with `mmap(PROT_NONE)` and then made readable/writable
//! everywhere except the lowest page, which is left as a guard page: a stack
//! overflow touches unmapped memory and faults instead of silently
//! corrupting whatever happens to sit below it.

use std::io;
use std::ptr;

/// Lowest stack size we will ever hand out, not counting the guard page.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default stack size used when a caller does not ask for a specific size.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

fn page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE never fails on the platforms we support.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Clamp a requested stack size against `RLIMIT_STACK`, falling back to
/// `DEFAULT_STACK_SIZE` when the limit cannot be read or is unlimited.
pub fn clamp_to_rlimit(requested: usize) -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: `rlim` is a valid out-pointer for getrlimit.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut rlim) };
    if rc != 0 || rlim.rlim_cur == libc::RLIM_INFINITY {
        return requested;
    }
    requested.min(rlim.rlim_cur as usize)
}

/// An mmap'd, guard-paged stack owned by a carrier or one-one thread.
pub struct Stack {
    base: *mut u8,
    len: usize,
}

// Safety: the mapping is only ever touched through `top`/`bottom`, and
// ownership moves with the `Stack` value.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a new guarded stack of at least `size` usable bytes.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page = page_size();
        let len = (size + page - 1) & !(page - 1);
        let mmap_len = len + page;

        // Safety: arguments describe an anonymous, non-file-backed mapping.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Safety: `base` is a freshly reserved mapping of `mmap_len` bytes;
        // the first page stays PROT_NONE as the guard page.
        let rc = unsafe {
            libc::mprotect(
                base.cast::<u8>().add(page).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Safety: `base`/`mmap_len` match the mapping just created.
            unsafe {
                libc::munmap(base, mmap_len);
            }
            return Err(err);
        }

        Ok(Self {
            base: base.cast(),
            len: mmap_len,
        })
    }

    /// Highest address of the stack, i.e. the initial stack pointer.
    ///
    /// Guaranteed 16-byte aligned since `mmap` always returns page-aligned
    /// memory and pages are always a multiple of 16 bytes.
    pub fn top(&self) -> usize {
        self.base as usize + self.len
    }

    /// Lowest address of the usable region, i.e. the top of the guard page.
    pub fn bottom(&self) -> usize {
        self.base as usize + page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `base`/`len` describe exactly the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &format_args!("{:#x}", self.top()))
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_is_above_bottom_and_aligned() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.top() % 16, 0);
    }

    #[test]
    fn rejects_below_minimum_by_clamping() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.top() - stack.bottom() >= MIN_STACK_SIZE);
    }

    #[test]
    fn rlimit_clamp_never_increases_request() {
        assert!(clamp_to_rlimit(1024) <= clamp_to_rlimit(usize::MAX).max(1024));
    }
}
