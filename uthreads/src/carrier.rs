//! The carrier dispatcher loop (§4.I): the heart of the M:N runtime.
//!
//! A carrier is a kernel task that does nothing but repeatedly take a
//! runnable [`ThreadDescriptor`] off the ready queue, switch into its saved
//! context, and react to why it came back. Preemption is delivered as a
//! signal the carrier sent to itself while user code was running.

use crate::bootstrap::runtime;
use crate::descriptor::{ThreadDescriptor, ThreadState};
use crate::id::ThreadId;
use crate::timer::{self, CarrierTimer};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::Ordering;

thread_local! {
    /// The thread-pointer slot (§4.F): the descriptor address for whichever
    /// user thread is currently installed on this kernel task, or null.
    static CURRENT: Cell<*const ThreadDescriptor> = const { Cell::new(std::ptr::null()) };

    static CARRIER_TIMER: RefCell<Option<CarrierTimer>> = const { RefCell::new(None) };

    /// Holds the lazily-built descriptor for a kernel task that calls into
    /// the API without ever having gone through `create` — chiefly the
    /// process's original thread driving `run_main`. Kept alive for the
    /// life of the task, same as `create_one_one`'s spawned closure keeps
    /// its own descriptor alive.
    static HOST_DESCRIPTOR: RefCell<Option<Arc<ThreadDescriptor>>> = const { RefCell::new(None) };
}

/// Installs `desc` in the calling task's thread-pointer slot, returning
/// whatever was there before so it can be restored.
fn install_current(desc: *const ThreadDescriptor) -> *const ThreadDescriptor {
    CURRENT.with(|c| c.replace(desc))
}

/// Reads the calling task's thread-pointer slot (§4.J `self`).
///
/// Returns `None` on a carrier that is between dispatches, or on a kernel
/// task that was never handed a descriptor.
pub fn current() -> Option<Arc<ThreadDescriptor>> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // Safety: a non-null slot always names a descriptor an `Arc` elsewhere
    // (the dispatcher's loop variable, or the OneOne task's own entry
    // frame) is keeping alive for at least as long as the slot holds it.
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }
}

/// Installs `desc` as current for the life of a OneOne task (§4.J `create`).
///
/// # Safety
///
/// Must be called at most once per kernel task, before any other code on
/// that task reads the thread-pointer slot.
pub(crate) unsafe fn install_one_one_current(desc: *const ThreadDescriptor) {
    install_current(desc);
}

/// Returns the calling kernel task's descriptor, registering it as an
/// implicit OneOne thread the first time it calls into the library if it
/// was never handed one by `create` — the process's original thread is the
/// usual case, since it drives [`crate::bootstrap::run_main`] without
/// having been `create`d itself.
pub(crate) fn current_or_adopt() -> Arc<ThreadDescriptor> {
    if let Some(desc) = current() {
        return desc;
    }
    HOST_DESCRIPTOR.with(|slot| {
        if let Some(desc) = slot.borrow().as_ref() {
            return Arc::clone(desc);
        }
        let entry: crate::descriptor::BoxedEntry =
            Box::new(|| Box::new(()) as Box<dyn Any + Send>);
        let desc = ThreadDescriptor::new_one_one(ThreadId::next(), entry);
        // Safety: `SYS_gettid` always succeeds and the result fits `pid_t`.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
        desc.set_ktid(tid);
        // Safety: first and only transition for an adopted descriptor,
        // before anything else can observe it.
        unsafe { desc.set_state(ThreadState::Running) };
        install_current(Arc::as_ptr(&desc));
        *slot.borrow_mut() = Some(Arc::clone(&desc));
        desc
    })
}

/// Fires when the per-carrier timer expires while user code is running.
///
/// If the running thread has disabled preemption, the timer is simply
/// re-armed and the signal handler returns, letting the critical section
/// finish on this same carrier. Otherwise control returns to the dispatcher.
extern "C" fn yield_current(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return;
    }
    // Safety: `ptr` was installed by `dispatch` below and remains valid for
    // the duration user code runs under this signal handler.
    let desc = unsafe { &*ptr };

    if desc.timer_disabled().load(Ordering::Acquire) {
        CARRIER_TIMER.with(|slot| {
            if let Some(t) = slot.borrow().as_ref() {
                t.start(runtime().config.time_slice);
            }
        });
        return;
    }

    // Safety: `ctx` is the `ucontext_t*` the kernel hands every
    // `SA_SIGINFO` handler; its `uc_sigmask` is the mask that was live the
    // instant this signal was delivered. We must capture it here because
    // the jump below skips `sigreturn`, which is the only other place that
    // mask would ever be recovered.
    let interrupted_mask = unsafe { (*ctx.cast::<libc::ucontext_t>()).uc_sigmask };
    // Safety: we are the carrier that just interrupted `desc`.
    unsafe { desc.set_sigmask(interrupted_mask) };

    let (main_ctx, return_ctx) = desc.contexts();
    // Safety: called on the same carrier that switched into `main_ctx`;
    // `return_ctx` was populated by that same switch and is what resumes
    // the dispatcher loop in `dispatch` below.
    unsafe {
        rt_stack::switch(main_ctx, return_ctx);
    }
}

/// A signal set with every signal blocked, the mask every carrier runs
/// its own (non-user-code) logic under.
pub(crate) fn all_blocked() -> libc::sigset_t {
    // Safety: `set` is a valid out-param for sigfillset.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        set
    }
}

/// Runs the dispatcher loop until the runtime's scheduling flag is cleared.
///
/// Spawned once per configured carrier by [`crate::bootstrap::init`].
pub(crate) fn run() {
    // Safety: blocking every signal on this task for its whole lifetime is
    // exactly step 1 of the dispatcher contract: preemption only becomes
    // deliverable once a user context's own mask is installed in `dispatch`.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &all_blocked(), std::ptr::null_mut());
    }
    timer::install_preempt_handler(yield_current);

    let carrier_timer = CarrierTimer::new().expect("failed to create carrier timer");
    CARRIER_TIMER.with(|slot| *slot.borrow_mut() = Some(carrier_timer));

    let saved_self = CURRENT.with(Cell::get);
    let rt = runtime();

    tracing::debug!("carrier started");
    while rt.scheduling_enabled.load(Ordering::Acquire) {
        let Some(t) = rt.ready_queue.take() else {
            std::hint::spin_loop();
            continue;
        };
        dispatch(&t);
    }
    tracing::debug!("carrier stopped");

    install_current(saved_self);
    CARRIER_TIMER.with(|slot| *slot.borrow_mut() = None);
}

/// Runs `t` until it suspends, then acts on why (§4.I steps c-g).
fn dispatch(t: &Arc<ThreadDescriptor>) {
    let rt = runtime();

    loop {
        // Safety (drain+raise): re-checked on every iteration, not just
        // before the first, so a signal `kill` queues while `t` is already
        // mid-dispatch (picked up by the `g.Running` redispatch below) is
        // actually raised on this carrier rather than silently left set —
        // otherwise the redispatch branch would spin forever re-observing
        // the same bit without ever delivering it (§4.I step c).
        if t.state() == ThreadState::Running {
            let sigs = t.pending_sigs().swap(0, Ordering::AcqRel);
            for signo in 1u32..=31 {
                if sigs & (1 << (signo - 1)) != 0 {
                    // Safety: `raise` targets the calling task only, never
                    // the thread group, matching §4.I's "to this carrier
                    // task" rule.
                    unsafe {
                        libc::raise(signo as libc::c_int);
                    }
                }
            }
        }

        let prev = install_current(Arc::as_ptr(t));
        CARRIER_TIMER.with(|slot| {
            if let Some(timer) = slot.borrow().as_ref() {
                timer.start(rt.config.time_slice);
            }
        });

        // Safety: `mask` is this thread's own saved mask (never including
        // `PREEMPT_SIGNAL`, which `api::sigmask` always strips), installed
        // on the shared kernel task for exactly the window user code runs
        // in — this is what lets the preemption timer, and any signal
        // queued by `kill`, actually become deliverable (§4.F/§4.I).
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &t.sigmask(), std::ptr::null_mut());
        }

        tracing::trace!(id = t.id.as_u64(), "dispatching");
        let (main_ctx, return_ctx) = t.contexts();
        // Safety: `t` came off the ready queue, so per descriptor invariant
        // 3 it owns no carrier yet and its `main_ctx` is either freshly
        // built or was last suspended by `yield_current`/a voluntary yield.
        unsafe {
            rt_stack::switch(return_ctx, main_ctx);
        }

        // Safety: every path that can return control here — `yield_current`
        // (which reads `uc_sigmask` before jumping away) and every
        // voluntary suspend point in `api`/`mutex` (which save-and-block
        // before switching) — has already saved `t`'s live mask into
        // `t.sigmask` and left the kernel task's actual mask at
        // all-blocked. This is a defensive re-assertion of that, not a
        // capture: step 1 of the dispatcher contract is "all signals
        // blocked outside user code."
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &all_blocked(), std::ptr::null_mut());
        }

        CARRIER_TIMER.with(|slot| {
            if let Some(timer) = slot.borrow().as_ref() {
                timer.stop();
            }
        });
        install_current(prev);

        match t.state() {
            ThreadState::Running => {
                if t.pending_sigs().load(Ordering::Acquire) != 0 {
                    tracing::trace!(id = t.id.as_u64(), "redispatching for pending signal");
                    continue;
                }
                rt.ready_queue.add(Arc::clone(t));
                tracing::trace!(id = t.id.as_u64(), "requeued");
                break;
            }
            ThreadState::WaitJoin | ThreadState::WaitMutex => {
                // Safety: `t` set `waiting_on` itself, under the relevant
                // member lock, before yielding (§4.J join, §4.K lock).
                let target = unsafe { t.waiting_on() };
                if let Some(target) = target {
                    target.release_member_lock();
                }
                tracing::trace!(id = t.id.as_u64(), state = ?t.state(), "parked");
                break;
            }
            ThreadState::Exited => {
                t.member_lock.acquire();
                t.wait.store(0, Ordering::Release);
                // Safety: `joiner` is only ever set while holding
                // `member_lock`, which we hold here.
                let joiner = unsafe { t.joiner() };
                t.member_lock.release();
                if let Some(joiner) = joiner {
                    rt.ready_queue.add(joiner);
                }
                tracing::trace!(id = t.id.as_u64(), "exited");
                break;
            }
            ThreadState::Init | ThreadState::Joined => break,
        }
    }
}
