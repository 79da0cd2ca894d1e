//! The dual-path mutex (§4.K): a futex-only fast path for pure 1:1 use that
//! upgrades permanently, the moment any M:N thread touches it, to a
//! member-lock-guarded waiter queue.

use crate::descriptor::{Mapping, ThreadDescriptor, ThreadState, Waitable};
use crate::error::LockError;
use crate::futex;
use crate::spinlock::RawSpinlock;
use rt_list::List;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

const FREE: u32 = 1;
const HELD: u32 = 0;

/// `ThreadId::next()` starts at 1 and never recycles, so 0 is safe as a
/// dedicated "no owner" sentinel — the full id, not a truncated/bit-ORed
/// tag, is what's stored, so two distinct threads can never compare equal.
const NO_OWNER: u64 = 0;

pub struct Mutex {
    member_lock: RawSpinlock,
    word: AtomicU32,
    owner: AtomicU64,
    mn_touched: AtomicBool,
    waiters: StdMutex<List<ThreadDescriptor>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            member_lock: RawSpinlock::new(),
            word: AtomicU32::new(FREE),
            owner: AtomicU64::new(NO_OWNER),
            mn_touched: AtomicBool::new(false),
            waiters: StdMutex::new(List::new()),
        }
    }

    /// Blocking lock. Returns immediately if `caller` already owns it
    /// (§2b's recursive self-lock tolerance).
    pub fn lock(self: &Arc<Self>, caller: &Arc<ThreadDescriptor>) {
        let tag = caller.id.as_u64();
        if self.owner.load(Ordering::Acquire) == tag {
            return;
        }
        if caller.mapping == Mapping::ManyMany {
            self.mn_touched.store(true, Ordering::Release);
        }

        if !self.mn_touched.load(Ordering::Acquire) {
            self.futex_path_lock(tag);
            return;
        }
        self.guarded_path_lock(caller, tag);
    }

    /// Non-blocking lock attempt.
    pub fn try_lock(self: &Arc<Self>, caller: &Arc<ThreadDescriptor>) -> Result<(), LockError> {
        let tag = caller.id.as_u64();
        if self.owner.load(Ordering::Acquire) == tag {
            return Ok(());
        }
        self.member_lock.acquire();
        let acquired = self
            .word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            self.owner.store(tag, Ordering::Release);
        }
        self.member_lock.release();
        if acquired {
            Ok(())
        } else {
            Err(LockError::WouldBlock)
        }
    }

    pub fn unlock(self: &Arc<Self>, caller: &Arc<ThreadDescriptor>) -> Result<(), LockError> {
        let tag = caller.id.as_u64();
        if self.owner.load(Ordering::Acquire) != tag {
            return Err(LockError::NotOwner);
        }

        self.member_lock.acquire();
        let next = self.waiters.lock().expect("mutex waiter queue poisoned").pop_front();
        match next {
            Some(waiter) => {
                self.owner.store(waiter.id.as_u64(), Ordering::Release);
                match waiter.mapping {
                    Mapping::ManyMany => {
                        crate::bootstrap::runtime().ready_queue.add(waiter);
                    }
                    Mapping::OneOne => {
                        self.word.store(HELD, Ordering::Release);
                        futex::wake(&self.word, 1);
                        drop(waiter);
                    }
                }
            }
            None => {
                self.owner.store(NO_OWNER, Ordering::Release);
                self.word.store(FREE, Ordering::Release);
                futex::wake(&self.word, 1);
            }
        }
        self.member_lock.release();
        Ok(())
    }

    fn futex_path_lock(&self, tag: u64) {
        loop {
            if self
                .word
                .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(tag, Ordering::Release);
                return;
            }
            futex::wait(&self.word, HELD);
        }
    }

    fn guarded_path_lock(self: &Arc<Self>, caller: &Arc<ThreadDescriptor>, tag: u64) {
        self.member_lock.acquire();
        if self.owner.load(Ordering::Acquire) == NO_OWNER {
            self.owner.store(tag, Ordering::Release);
            self.word.store(HELD, Ordering::Release);
            self.member_lock.release();
            return;
        }

        self.waiters
            .lock()
            .expect("mutex waiter queue poisoned")
            .push_back(Arc::clone(caller));

        match caller.mapping {
            Mapping::ManyMany => {
                // Safety: `caller` is the running thread publishing its own
                // suspension state before yielding, per §5's protocol.
                unsafe {
                    caller.set_waiting_on(Some(Arc::clone(self) as Arc<dyn Waitable>));
                    caller.set_state(ThreadState::WaitMutex);
                }
                caller.timer_disabled().store(true, Ordering::Release);
                // Safety: see `api::yield_now`'s identical save-before-suspend.
                let mut prev: libc::sigset_t = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::pthread_sigmask(
                        libc::SIG_SETMASK,
                        &crate::carrier::all_blocked(),
                        &mut prev,
                    );
                }
                unsafe { caller.set_sigmask(prev) };
                let (main_ctx, return_ctx) = caller.contexts();
                // Safety: the dispatcher releases `member_lock` once it
                // observes `WaitMutex` on return (§4.I g.WaitMutex).
                unsafe {
                    rt_stack::switch(main_ctx, return_ctx);
                }
                caller.timer_disabled().store(false, Ordering::Release);
                // Safety: resumed only after a releasing thread set us as
                // owner and woke us; clearing our own fields is safe.
                unsafe {
                    caller.set_state(ThreadState::Running);
                    caller.set_waiting_on(None);
                }
            }
            Mapping::OneOne => {
                self.member_lock.release();
                loop {
                    if self.owner.load(Ordering::Acquire) == tag {
                        return;
                    }
                    futex::wait(&self.word, HELD);
                }
            }
        }
    }
}

impl Waitable for Mutex {
    fn release_member_lock(&self) {
        self.member_lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ThreadId;

    fn fake_one_one() -> Arc<ThreadDescriptor> {
        ThreadDescriptor::new_one_one(
            ThreadId::next(),
            Box::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
        )
    }

    #[test]
    fn uncontended_lock_unlock_roundtrip() {
        let mutex = Arc::new(Mutex::new());
        let t = fake_one_one();
        mutex.lock(&t);
        mutex.unlock(&t).unwrap();
        mutex.lock(&t);
        mutex.unlock(&t).unwrap();
    }

    #[test]
    fn recursive_lock_by_owner_is_a_noop() {
        let mutex = Arc::new(Mutex::new());
        let t = fake_one_one();
        mutex.lock(&t);
        mutex.lock(&t);
        mutex.unlock(&t).unwrap();
    }

    #[test]
    fn unlock_by_non_owner_errors() {
        let mutex = Arc::new(Mutex::new());
        let a = fake_one_one();
        let b = fake_one_one();
        mutex.lock(&a);
        assert!(matches!(mutex.unlock(&b), Err(LockError::NotOwner)));
    }

    #[test]
    fn trylock_on_held_mutex_is_busy() {
        let mutex = Arc::new(Mutex::new());
        let a = fake_one_one();
        let b = fake_one_one();
        mutex.lock(&a);
        assert!(matches!(mutex.try_lock(&b), Err(LockError::WouldBlock)));
        mutex.unlock(&a).unwrap();
        assert!(mutex.try_lock(&b).is_ok());
    }
}
