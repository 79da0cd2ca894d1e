//! The public thread API (§4.J): create, join, exit, current-thread lookup,
//! yield, kill, sigmask, and the `mutex_*`/`spin_*` handle wrappers.
//!
//! `start` is taken as a closure rather than a function-pointer-plus-`arg`
//! pair; a closure's captures are this library's `arg`, which reads more
//! naturally in Rust than threading an opaque pointer through.

use crate::bootstrap::runtime;
use crate::carrier;
use crate::descriptor::{BoxedEntry, Mapping, ThreadDescriptor, ThreadState, Waitable};
use crate::error::{CreateError, JoinError, KillError, RecordStatus, SigmaskError, Status};
use crate::futex;
use crate::id::ThreadId;
use crate::mutex::Mutex;
use crate::spinlock::Spinlock;
use crate::timer;
use rt_stack::Stack;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// An opaque reference to a created thread. Equality is by identity.
#[derive(Clone, Debug)]
pub struct ThreadHandle(pub(crate) Arc<ThreadDescriptor>);

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for ThreadHandle {}

/// An opaque mutex reference.
#[derive(Clone)]
pub struct MutexHandle(Arc<Mutex>);

/// An opaque spinlock reference.
#[derive(Clone)]
pub struct SpinlockHandle(Arc<Spinlock>);

/// Returns the calling kernel task's descriptor, adopting it as an
/// implicit OneOne thread on first use if `create` never built one (see
/// [`carrier::current_or_adopt`]).
fn current_or_panic() -> Arc<ThreadDescriptor> {
    carrier::current_or_adopt()
}

fn record<E>(err: E) -> E
where
    for<'a> Status: From<&'a E>,
{
    Status::from(&err).record();
    err
}

/// Creates a new thread running `start` to completion, under `mapping`.
#[tracing::instrument(skip(start))]
pub fn create<F, R>(mapping: Mapping, start: F) -> Result<ThreadHandle, CreateError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Any + Send + 'static,
{
    let id = ThreadId::next();
    let entry: BoxedEntry = Box::new(move || Box::new(start()) as Box<dyn Any + Send>);

    let descriptor = match mapping {
        Mapping::OneOne => create_one_one(id, entry)?,
        Mapping::ManyMany => create_many_many(id, entry)?,
    };
    Status::Success.record();
    tracing::debug!(id = descriptor.id.as_u64(), ?mapping, "thread created");
    Ok(ThreadHandle(descriptor))
}

fn create_one_one(id: ThreadId, entry: BoxedEntry) -> Result<Arc<ThreadDescriptor>, CreateError> {
    let descriptor = ThreadDescriptor::new_one_one(id, entry);
    let spawned = Arc::clone(&descriptor);
    std::thread::Builder::new()
        .name(format!("uthread-{}", id.as_u64()))
        .stack_size(rt_stack::DEFAULT_STACK_SIZE)
        .spawn(move || one_one_trampoline(spawned))
        .map_err(CreateError::TaskCreation)?;
    Ok(descriptor)
}

fn create_many_many(id: ThreadId, entry: BoxedEntry) -> Result<Arc<ThreadDescriptor>, CreateError> {
    let stack = Stack::new(rt_stack::DEFAULT_STACK_SIZE).map_err(CreateError::StackAllocation)?;
    let descriptor = ThreadDescriptor::new_many_many(id, entry, stack);

    let spawned = Arc::clone(&descriptor);
    let ctx = rt_stack::spawn(descriptor.stack(), move || many_many_trampoline(spawned));
    let (main_ctx, _) = descriptor.contexts();
    main_ctx.adopt(ctx);

    runtime().ready_queue.add(Arc::clone(&descriptor));
    Ok(descriptor)
}

/// Entry point run on a freshly spawned OneOne kernel task.
fn one_one_trampoline(desc: Arc<ThreadDescriptor>) {
    // Safety: `SYS_gettid` always succeeds and the result fits `pid_t`.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    desc.set_ktid(tid);
    // Safety: the first and only installation on this kernel task.
    unsafe { carrier::install_one_one_current(Arc::as_ptr(&desc)) };
    // Safety: first state transition, before any other thread can
    // reasonably observe this descriptor racing it.
    unsafe { desc.set_state(ThreadState::Running) };

    let entry = desc.take_entry();
    let ret = entry();
    retire(&desc, ret);
}

/// Entry point run the first time a ManyMany context is switched into.
fn many_many_trampoline(desc: Arc<ThreadDescriptor>) -> ! {
    // Safety: see `one_one_trampoline`.
    unsafe { desc.set_state(ThreadState::Running) };

    let entry = desc.take_entry();
    let ret = entry();
    retire(&desc, ret)
}

/// Stores `ret`, marks `me` Exited, and terminates its underlying task.
/// Shared by the natural-return path in both trampolines and by [`exit`].
fn retire(me: &Arc<ThreadDescriptor>, ret: Box<dyn Any + Send>) -> ! {
    // Safety: called at most once per thread, immediately before Exited.
    unsafe {
        me.store_ret(ret);
        me.set_state(ThreadState::Exited);
    }
    match me.mapping {
        Mapping::OneOne => {
            me.wait.store(0, Ordering::Release);
            futex::wake(&me.wait, i32::MAX);
            // Safety: `SYS_exit` (not `exit_group`) terminates only the
            // calling kernel task, matching a OneOne thread's contract that
            // exiting does not touch its siblings; it never returns.
            unsafe {
                libc::syscall(libc::SYS_exit, 0);
            }
            unreachable!("SYS_exit does not return")
        }
        Mapping::ManyMany => {
            let (_, return_ctx) = me.contexts();
            // Safety: `return_ctx` was populated by the dispatcher's most
            // recent switch into this thread (§4.I step e).
            unsafe { rt_stack::jump_into(return_ctx) }
        }
    }
}

/// Ends the calling thread, handing `value` to its joiner.
pub fn exit(value: Box<dyn Any + Send>) -> ! {
    let me = current_or_panic();
    retire(&me, value)
}

/// Blocks until `target` terminates, returning the value it exited with.
#[tracing::instrument(skip(target))]
pub fn join(target: &ThreadHandle) -> Result<Box<dyn Any + Send>, JoinError> {
    let caller = current_or_panic();
    let target = &target.0;

    if Arc::ptr_eq(&caller, target) {
        return Err(record(JoinError::SelfJoin));
    }
    if target.state() == ThreadState::Joined {
        return Err(record(JoinError::AlreadyJoined));
    }

    target.member_lock.acquire();
    // Safety: `member_lock` held.
    if unsafe { target.joiner() }.is_some() {
        target.member_lock.release();
        return Err(record(JoinError::AlreadyHasJoiner));
    }

    if caller.mapping == Mapping::ManyMany {
        caller.timer_disabled().store(true, Ordering::Release);
    }
    // Safety: `caller` publishes its own suspension state while `target`'s
    // `member_lock` is held across the upcoming suspension (§4.J join).
    unsafe {
        target.set_joiner(Some(Arc::clone(&caller)));
        caller.set_waiting_on(Some(Arc::clone(target) as Arc<dyn Waitable>));
        caller.set_state(ThreadState::WaitJoin);
    }

    if target.state() == ThreadState::Exited {
        target.member_lock.release();
    } else {
        match caller.mapping {
            Mapping::OneOne => {
                target.member_lock.release();
                while target.wait.load(Ordering::Acquire) != 0 {
                    futex::wait(&target.wait, 1);
                }
            }
            Mapping::ManyMany => {
                // Safety: see `yield_now`'s identical save-before-suspend.
                let mut prev: libc::sigset_t = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::pthread_sigmask(libc::SIG_SETMASK, &carrier::all_blocked(), &mut prev);
                }
                unsafe { caller.set_sigmask(prev) };
                let (main_ctx, return_ctx) = caller.contexts();
                // Safety: the dispatcher releases `target.member_lock` on
                // observing `WaitJoin` (§4.I g.WaitJoin); we resume only
                // once the exit path enqueues us (§4.I g.Exited).
                unsafe { rt_stack::switch(main_ctx, return_ctx) };
            }
        }
    }

    // Safety: resumed/woken only after `target` retired.
    unsafe {
        caller.set_state(ThreadState::Running);
        caller.set_waiting_on(None);
    }
    if caller.mapping == Mapping::ManyMany {
        caller.timer_disabled().store(false, Ordering::Release);
    }

    target.member_lock.acquire();
    // Safety: `member_lock` held.
    let ret = unsafe { target.take_ret() }.expect("an Exited thread always has a stored return");
    // Safety: we are the sole joiner, which is the only thread permitted to
    // advance a target past Exited.
    unsafe { target.set_state(ThreadState::Joined) };
    target.member_lock.release();

    // Safety: join is the sole place a ManyMany stack/context is reclaimed,
    // and it happens after the target is Joined and unreachable elsewhere.
    unsafe { target.take_stack() };

    Status::Success.record();
    Ok(ret)
}

/// Returns a handle to the calling thread.
///
/// A kernel task that calls this (or any other API function) without
/// having gone through [`create`] — notably the process's original thread
/// — is transparently adopted as an implicit OneOne thread the first time.
pub fn current() -> ThreadHandle {
    ThreadHandle(current_or_panic())
}

/// Voluntarily gives up the remainder of the calling thread's time slice.
pub fn yield_now() {
    let me = current_or_panic();
    match me.mapping {
        // Safety: always safe to call.
        Mapping::OneOne => unsafe {
            libc::sched_yield();
        },
        Mapping::ManyMany => {
            me.timer_disabled().store(true, Ordering::Release);
            // Safety: `prev` is a valid out-param; saving our own live mask
            // before handing the kernel task back to the dispatcher is
            // this suspend point's half of the save/restore pair described
            // on `ThreadDescriptor`'s `sigmask` field.
            let mut prev: libc::sigset_t = unsafe { std::mem::zeroed() };
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &carrier::all_blocked(), &mut prev);
            }
            unsafe { me.set_sigmask(prev) };
            let (main_ctx, return_ctx) = me.contexts();
            // Safety: symmetric with the preemption handler; `main_ctx`
            // remains valid since `me`'s state stays Running across this.
            unsafe { rt_stack::switch(main_ctx, return_ctx) };
            me.timer_disabled().store(false, Ordering::Release);
        }
    }
}

/// Changes the calling thread's signal mask. The preemption signal is
/// always stripped from `set` first — the library reserves it.
pub fn sigmask(
    how: libc::c_int,
    set: Option<&libc::sigset_t>,
    oldset: Option<&mut libc::sigset_t>,
) -> Result<(), SigmaskError> {
    if ![libc::SIG_BLOCK, libc::SIG_UNBLOCK, libc::SIG_SETMASK].contains(&how) {
        return Err(record(SigmaskError::InvalidHow));
    }

    let me = current_or_panic();
    if me.mapping == Mapping::ManyMany {
        me.timer_disabled().store(true, Ordering::Release);
    }

    let mut stripped = set.copied();
    if let Some(s) = stripped.as_mut() {
        // Safety: `s` is a valid, owned `sigset_t`.
        unsafe { libc::sigdelset(s, timer::PREEMPT_SIGNAL()) };
    }
    let set_ptr = stripped.as_ref().map_or(std::ptr::null(), std::ptr::from_ref);
    let oldset_ptr = oldset.map_or(std::ptr::null_mut(), std::ptr::from_mut);

    // Safety: `set_ptr`/`oldset_ptr` are either null or point at a valid
    // `sigset_t` for the duration of this call.
    let rc = unsafe { libc::pthread_sigmask(how, set_ptr, oldset_ptr) };

    if me.mapping == Mapping::ManyMany {
        me.timer_disabled().store(false, Ordering::Release);
    }

    if rc != 0 {
        Err(record(SigmaskError::Failed(std::io::Error::last_os_error())))
    } else {
        Status::Success.record();
        Ok(())
    }
}

/// Delivers `signo` to `target`. For a OneOne target, the signal is sent
/// immediately; for a ManyMany target, it is queued and delivered the next
/// time the dispatcher runs that thread (§4.I step c).
pub fn kill(target: &ThreadHandle, signo: libc::c_int) -> Result<(), KillError> {
    if !(1..=31).contains(&signo) {
        return Err(record(KillError::InvalidSignal));
    }
    let target = &target.0;

    match target.mapping {
        Mapping::OneOne => {
            let tid = target.ktid();
            // Safety: `tid` names a live kernel task sharing this
            // process's thread group; `tgkill` is the targeted-signal
            // primitive the host exposes for exactly this purpose.
            let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signo) };
            if rc != 0 {
                return Err(record(KillError::SendFailed(std::io::Error::last_os_error())));
            }
        }
        Mapping::ManyMany => {
            target.member_lock.acquire();
            let bit = 1u32 << (signo as u32 - 1);
            target.pending_sigs().fetch_or(bit, Ordering::AcqRel);
            target.member_lock.release();
        }
    }
    Status::Success.record();
    Ok(())
}

pub fn mutex_init() -> MutexHandle {
    MutexHandle(Arc::new(Mutex::new()))
}

pub fn mutex_lock(m: &MutexHandle) {
    m.0.lock(&current_or_panic());
}

pub fn mutex_trylock(m: &MutexHandle) -> Result<(), crate::error::LockError> {
    m.0.try_lock(&current_or_panic()).map_err(record)
}

pub fn mutex_unlock(m: &MutexHandle) -> Result<(), crate::error::LockError> {
    m.0.unlock(&current_or_panic()).map_err(record)
}

pub fn mutex_destroy(_m: MutexHandle) {}

pub fn spin_init() -> SpinlockHandle {
    SpinlockHandle(Arc::new(Spinlock::new()))
}

pub fn spin_lock(s: &SpinlockHandle) {
    s.0.lock(current_or_panic().id);
}

pub fn spin_trylock(s: &SpinlockHandle) -> Result<(), crate::error::LockError> {
    if s.0.try_lock(current_or_panic().id) {
        Ok(())
    } else {
        Err(record(crate::error::LockError::WouldBlock))
    }
}

pub fn spin_unlock(s: &SpinlockHandle) {
    s.0.unlock(current_or_panic().id);
}

pub fn spin_destroy(_s: SpinlockHandle) {}
