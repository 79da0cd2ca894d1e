//! The thread descriptor (§3/§4.F): the one record type shared by both
//! mappings, carrying exactly the fields each needs.

use crate::id::ThreadId;
use crate::spinlock::RawSpinlock;
use rt_list::Links;
use rt_stack::{Context, Stack};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    OneOne,
    ManyMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    Running,
    WaitJoin,
    WaitMutex,
    Exited,
    Joined,
}

pub(crate) type BoxedEntry = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;

/// Something whose `member_lock` can be released by the dispatcher once a
/// descriptor parked on it (§4.I g.WaitJoin/WaitMutex). Implemented by
/// [`ThreadDescriptor`] itself (for join) and by [`crate::mutex::Mutex`]
/// (for mutex contention) so `waiting_on` can point at either uniformly.
pub(crate) trait Waitable: Send + Sync {
    fn release_member_lock(&self);
}

pub(crate) enum MappingState {
    /// A OneOne thread runs on the stack its kernel task was created with
    /// (guard page and all); nothing here needs to track it.
    OneOne { ktid: AtomicI32 },
    ManyMany {
        main_ctx: Context,
        return_ctx: Context,
        pending_sigs: AtomicU32,
        timer_disabled: AtomicBool,
        /// The signal mask in effect while this thread (not the carrier
        /// dispatching it) runs. Saved by the dispatcher when it takes
        /// control back and reinstalled on the next dispatch, since a
        /// ManyMany thread shares its carrier's kernel task and has no OS
        /// mask of its own between dispatches.
        sigmask: UnsafeCell<libc::sigset_t>,
        stack: UnsafeCell<Option<Stack>>,
    },
}

/// Canonical per-thread record for every user thread, regardless of
/// mapping. Interior-mutable fields are protected by `member_lock`, except
/// where the protocol (§5) permits the owning thread to mutate them
/// lock-free while it is the one running.
pub struct ThreadDescriptor {
    pub id: ThreadId,
    pub mapping: Mapping,
    state: UnsafeCell<ThreadState>,
    pub(crate) member_lock: RawSpinlock,
    entry: UnsafeCell<Option<BoxedEntry>>,
    ret: UnsafeCell<Option<Box<dyn Any + Send>>>,
    /// Futex-compatible word: nonzero while the thread has not fully
    /// retired.
    pub(crate) wait: AtomicU32,
    joiner: UnsafeCell<Option<Arc<ThreadDescriptor>>>,
    waiting_on: UnsafeCell<Option<Arc<dyn Waitable>>>,
    pub(crate) ready_link: Links<ThreadDescriptor>,
    pub(crate) variant: MappingState,
}

// Safety: every field besides `ready_link`'s raw pointers is either atomic
// or is only ever mutated while the accessor holds `member_lock` (or is the
// thread currently "running" on its own descriptor, per §5's shared
// resource policy). `ready_link` is itself only touched by whichever
// carrier holds the ready-queue lock.
unsafe impl Send for ThreadDescriptor {}
// Safety: see the `Send` impl above.
unsafe impl Sync for ThreadDescriptor {}

impl fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("id", &self.id)
            .field("mapping", &self.mapping)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ThreadDescriptor {
    pub(crate) fn new_one_one(id: ThreadId, entry: BoxedEntry) -> Arc<Self> {
        Arc::new(Self {
            id,
            mapping: Mapping::OneOne,
            state: UnsafeCell::new(ThreadState::Init),
            member_lock: RawSpinlock::new(),
            entry: UnsafeCell::new(Some(entry)),
            ret: UnsafeCell::new(None),
            wait: AtomicU32::new(1),
            joiner: UnsafeCell::new(None),
            waiting_on: UnsafeCell::new(None),
            ready_link: Links::new(),
            variant: MappingState::OneOne {
                ktid: AtomicI32::new(0),
            },
        })
    }

    pub(crate) fn new_many_many(id: ThreadId, entry: BoxedEntry, stack: Stack) -> Arc<Self> {
        Arc::new(Self {
            id,
            mapping: Mapping::ManyMany,
            state: UnsafeCell::new(ThreadState::Init),
            member_lock: RawSpinlock::new(),
            entry: UnsafeCell::new(Some(entry)),
            ret: UnsafeCell::new(None),
            wait: AtomicU32::new(1),
            joiner: UnsafeCell::new(None),
            waiting_on: UnsafeCell::new(None),
            ready_link: Links::new(),
            variant: MappingState::ManyMany {
                main_ctx: Context::empty(),
                return_ctx: Context::empty(),
                pending_sigs: AtomicU32::new(0),
                timer_disabled: AtomicBool::new(false),
                // Safety: `mask` is a valid out-param for sigemptyset.
                sigmask: UnsafeCell::new(unsafe {
                    let mut mask: libc::sigset_t = std::mem::zeroed();
                    libc::sigemptyset(&mut mask);
                    mask
                }),
                stack: UnsafeCell::new(Some(stack)),
            },
        })
    }

    /// Current state. Safe to read from any thread: writes are published
    /// either under `member_lock` or, for the owning thread's own
    /// transitions, happen-before the next dispatch via the context switch.
    pub fn state(&self) -> ThreadState {
        // Safety: `ThreadState` is `Copy`; a torn read is impossible and a
        // stale read is tolerated by every caller per the protocol above.
        unsafe { *self.state.get() }
    }

    /// # Safety
    ///
    /// Caller must hold `member_lock`, or be the descriptor's own thread
    /// publishing its own transition before yielding.
    pub(crate) unsafe fn set_state(&self, state: ThreadState) {
        // Safety: delegated to the caller.
        unsafe {
            *self.state.get() = state;
        }
    }

    pub(crate) fn take_entry(&self) -> BoxedEntry {
        // Safety: only ever called once, by the thread's own entry
        // trampoline, before any other thread observes this descriptor.
        unsafe {
            (*self.entry.get())
                .take()
                .expect("thread entry invoked twice")
        }
    }

    /// # Safety
    ///
    /// Must only be called once, by the thread's own entry trampoline,
    /// immediately before marking the descriptor Exited.
    pub(crate) unsafe fn store_ret(&self, ret: Box<dyn Any + Send>) {
        // Safety: delegated to the caller.
        unsafe {
            *self.ret.get() = Some(ret);
        }
    }

    /// # Safety
    ///
    /// Caller must ensure the descriptor is Exited or Joined (the return
    /// value is written exactly once before Exited and never mutated
    /// after).
    pub(crate) unsafe fn take_ret(&self) -> Option<Box<dyn Any + Send>> {
        // Safety: delegated to the caller.
        unsafe { (*self.ret.get()).take() }
    }

    /// # Safety
    ///
    /// Caller must hold `member_lock`.
    pub(crate) unsafe fn joiner(&self) -> Option<Arc<ThreadDescriptor>> {
        // Safety: delegated to the caller.
        unsafe { (*self.joiner.get()).clone() }
    }

    /// # Safety
    ///
    /// Caller must hold `member_lock`.
    pub(crate) unsafe fn set_joiner(&self, joiner: Option<Arc<ThreadDescriptor>>) {
        // Safety: delegated to the caller.
        unsafe {
            *self.joiner.get() = joiner;
        }
    }

    /// # Safety
    ///
    /// Caller must be the owning thread, setting its own `waiting_on`
    /// before yielding.
    pub(crate) unsafe fn set_waiting_on(&self, target: Option<Arc<dyn Waitable>>) {
        // Safety: delegated to the caller.
        unsafe {
            *self.waiting_on.get() = target;
        }
    }

    /// # Safety
    ///
    /// Caller must be the dispatcher acting on a descriptor it just
    /// suspended, or the owning thread itself.
    pub(crate) unsafe fn waiting_on(&self) -> Option<Arc<dyn Waitable>> {
        // Safety: delegated to the caller.
        unsafe { (*self.waiting_on.get()).clone() }
    }

    pub(crate) fn pending_sigs(&self) -> &AtomicU32 {
        match &self.variant {
            MappingState::ManyMany { pending_sigs, .. } => pending_sigs,
            MappingState::OneOne { .. } => unreachable!("pending_sigs is ManyMany-only"),
        }
    }

    pub(crate) fn timer_disabled(&self) -> &AtomicBool {
        match &self.variant {
            MappingState::ManyMany { timer_disabled, .. } => timer_disabled,
            MappingState::OneOne { .. } => unreachable!("timer_disabled is ManyMany-only"),
        }
    }

    /// The signal mask this thread last ran with. Only ever read/written
    /// by the carrier currently dispatching this descriptor.
    pub(crate) fn sigmask(&self) -> libc::sigset_t {
        match &self.variant {
            // Safety: exclusive to the dispatching carrier between
            // install and save (see `sigmask` field doc).
            MappingState::ManyMany { sigmask, .. } => unsafe { *sigmask.get() },
            MappingState::OneOne { .. } => unreachable!("sigmask is ManyMany-only"),
        }
    }

    /// # Safety
    ///
    /// Caller must be the carrier that just regained control from this
    /// descriptor's user context.
    pub(crate) unsafe fn set_sigmask(&self, mask: libc::sigset_t) {
        match &self.variant {
            // Safety: delegated to the caller.
            MappingState::ManyMany { sigmask, .. } => unsafe { *sigmask.get() = mask },
            MappingState::OneOne { .. } => unreachable!("sigmask is ManyMany-only"),
        }
    }

    pub(crate) fn contexts(&self) -> (&Context, &Context) {
        match &self.variant {
            MappingState::ManyMany {
                main_ctx,
                return_ctx,
                ..
            } => (main_ctx, return_ctx),
            MappingState::OneOne { .. } => unreachable!("contexts are ManyMany-only"),
        }
    }

    /// Borrows the stack backing this ManyMany thread's context. Only valid
    /// before the thread's first dispatch, while `create` is still wiring
    /// up its initial context.
    pub(crate) fn stack(&self) -> &Stack {
        match &self.variant {
            // Safety: nothing else touches the stack slot until the first
            // dispatch switches into `main_ctx`, which happens strictly
            // after `create` finishes building it.
            MappingState::ManyMany { stack, .. } => unsafe {
                (*stack.get()).as_ref().expect("stack taken before first dispatch")
            },
            MappingState::OneOne { .. } => unreachable!("stack is ManyMany-only"),
        }
    }

    pub(crate) fn ktid(&self) -> libc::pid_t {
        match &self.variant {
            MappingState::OneOne { ktid, .. } => ktid.load(Ordering::Acquire),
            MappingState::ManyMany { .. } => unreachable!("ktid is OneOne-only"),
        }
    }

    pub(crate) fn set_ktid(&self, ktid: libc::pid_t) {
        match &self.variant {
            MappingState::OneOne { ktid: cell } => cell.store(ktid, Ordering::Release),
            MappingState::ManyMany { .. } => unreachable!("ktid is OneOne-only"),
        }
    }

    /// # Safety
    ///
    /// Caller must ensure no other thread observes the stack slot
    /// concurrently; used once at join time to drop a ManyMany stack.
    pub(crate) unsafe fn take_stack(&self) -> Option<Stack> {
        match &self.variant {
            MappingState::ManyMany { stack, .. } =>
            // Safety: delegated to the caller.
            unsafe {
                (*stack.get()).take()
            },
            MappingState::OneOne { .. } => None,
        }
    }
}

impl Waitable for ThreadDescriptor {
    fn release_member_lock(&self) {
        self.member_lock.release();
    }
}

// Safety: `ready_link` is always valid for the lifetime of the descriptor
// it's embedded in, and `Arc<ThreadDescriptor>` is the owning handle type
// used by every list this descriptor is linked into (the ready queue and
// mutex waiter queues).
unsafe impl rt_list::Linked for ThreadDescriptor {
    type Handle = Arc<ThreadDescriptor>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        // Safety: `Arc::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Arc::into_raw(handle).cast_mut()) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: `ptr` was produced by `into_ptr` from a live `Arc`.
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        let offset = std::mem::offset_of!(ThreadDescriptor, ready_link);
        // Safety: `ptr` points to a live `ThreadDescriptor`, so offsetting
        // to its embedded `ready_link` field stays in bounds.
        unsafe { ptr.byte_add(offset).cast() }
    }
}
