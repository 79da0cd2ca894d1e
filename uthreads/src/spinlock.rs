//! The atomic lock primitive (§4.A) and the public ownership-tracking
//! [`Spinlock`] built on top of it.

use crate::id::ThreadId;
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const FREE: u32 = 1;
const HELD: u32 = 0;

/// A bare CAS spinlock: no fairness, no deadlock detection, no ownership
/// tracking. Used internally for short critical sections like a
/// descriptor's `member_lock`.
#[derive(Debug)]
pub struct RawSpinlock {
    word: AtomicU32,
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(FREE),
        }
    }

    pub fn acquire(&self) {
        while self
            .word
            .compare_exchange_weak(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    pub fn release(&self) {
        self.word.store(FREE, Ordering::Release);
    }
}

/// The public ownership-tracking spinlock exposed as `spin_init`/`spin_lock`/
/// `spin_trylock`/`spin_unlock`/`spin_destroy`.
///
/// Unlike [`RawSpinlock`], this tracks which thread holds it: `lock` on a
/// spinlock already held by the caller returns immediately (not a deadlock,
/// since a bare spinlock has no wait queue to block the caller on), and
/// `unlock` by a non-owner silently no-ops rather than corrupting the lock
/// word.
#[derive(Debug)]
pub struct Spinlock {
    inner: RawSpinlock,
    owner: AtomicU64,
}

/// `ThreadId::next()` starts at 1 and never recycles, so 0 is safe as a
/// dedicated "no owner" sentinel — unlike a truncated/bit-ORed tag, the
/// full id can never collide between two distinct threads.
const NO_OWNER: u64 = 0;

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            inner: RawSpinlock::new(),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    pub fn lock(&self, caller: ThreadId) {
        if self.owner.load(Ordering::Acquire) == caller.as_u64() {
            return;
        }
        self.inner.acquire();
        self.owner.store(caller.as_u64(), Ordering::Release);
    }

    pub fn try_lock(&self, caller: ThreadId) -> bool {
        if self.owner.load(Ordering::Acquire) == caller.as_u64() {
            return true;
        }
        if self
            .inner
            .word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(caller.as_u64(), Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn unlock(&self, caller: ThreadId) {
        if self.owner.load(Ordering::Acquire) != caller.as_u64() {
            tracing::warn!(?caller, "spinlock unlocked by non-owner, ignoring");
            return;
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = Spinlock::new();
        let me = ThreadId::next();
        lock.lock(me);
        lock.unlock(me);
        lock.lock(me);
        lock.unlock(me);
    }

    #[test]
    fn recursive_lock_by_owner_does_not_deadlock() {
        let lock = Spinlock::new();
        let me = ThreadId::next();
        lock.lock(me);
        lock.lock(me);
        lock.unlock(me);
    }

    #[test]
    fn unlock_by_non_owner_is_a_noop() {
        let lock = Spinlock::new();
        let me = ThreadId::next();
        let other = ThreadId::next();
        lock.lock(me);
        lock.unlock(other);
        assert!(!lock.try_lock(other));
        lock.unlock(me);
        assert!(lock.try_lock(other));
    }
}
