//! Guarded stacks and raw context switching.
//!
//! This crate provides the two low-level primitives a user-mode thread
//! runtime needs to run code on a stack it did not get from the kernel:
//! a guard-paged [`Stack`] allocator and a [`Context`] switch that swaps
//! the callee-saved registers and the stack pointer between two call
//! stacks. Everything above this (descriptors, scheduling, the thread
//! pointer slot) lives in the crate that embeds this one.
//!
//! The context switch is the only place in the dependent crate that needs
//! unsafe hand-written assembly; every other crate interacts with it
//! through [`Stack::new`], [`Context::empty`] and [`switch`]/[`jump_into`].

#![feature(never_type)]

mod arch;
mod stack;

pub use arch::Context;
pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE, Stack, clamp_to_rlimit};

struct ThreadEntry {
    f: Option<Box<dyn FnOnce() -> ! + 'static>>,
}

impl ThreadEntry {
    unsafe fn take(&mut self) -> Box<dyn FnOnce() -> ! + 'static> {
        self.f.take().expect("thread entry invoked twice")
    }
}

/// Entry point invoked by the architecture trampoline the first time a
/// context is switched into. `arg` is whatever pointer was passed to
/// [`spawn`].
///
/// # Safety
///
/// Must only ever be called once, by the trampoline written into a stack
/// by [`spawn`], and never called directly.
unsafe extern "C" fn thread_entry_trampoline(arg: *mut ()) -> ! {
    // Safety: `arg` was produced by `spawn` from a boxed `ThreadEntry` and
    // is only ever read back here, exactly once, then freed.
    unsafe {
        let mut entry = Box::from_raw(arg.cast::<ThreadEntry>());
        let f = entry.take();
        f()
    }
}

/// Builds a fresh [`Context`] on `stack` that, once switched into, runs `f`
/// and never returns.
///
/// `f` is boxed and leaked onto the heap; its ownership is reclaimed by
/// [`thread_entry_trampoline`] the first (and only) time the context runs.
pub fn spawn<F>(stack: &Stack, f: F) -> Context
where
    F: FnOnce() -> ! + 'static,
{
    let boxed: Box<dyn FnOnce() -> ! + 'static> = Box::new(f);
    let entry = Box::into_raw(Box::new(ThreadEntry { f: Some(boxed) }));

    // Safety: `stack.top()` is a freshly allocated, exclusively owned
    // region at least MIN_STACK_SIZE bytes long and 16-byte aligned.
    unsafe { arch::init_stack(stack.top(), entry.cast()) }
}

/// Saves the currently running context into `from` and resumes `to`.
///
/// # Safety
///
/// Both contexts must come from [`Context::empty`], [`spawn`], or a prior
/// switch, and must not be entered concurrently from more than one carrier.
pub unsafe fn switch(from: &Context, to: &Context) {
    // Safety: delegated to the caller.
    unsafe { arch::switch(from, to) }
}

/// Resumes `to` without saving the current context anywhere.
///
/// # Safety
///
/// `to` must come from [`Context::empty`], [`spawn`], or a prior switch.
pub unsafe fn jump_into(to: &Context) -> ! {
    // Safety: delegated to the caller.
    unsafe { arch::jump_into(to) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn switch_into_thread_and_back() {
        thread_local! {
            static RAN: Cell<bool> = const { Cell::new(false) };
        }

        let stack = Stack::new(64 * 1024).unwrap();
        let main_ctx = Context::empty();
        let main_ctx_ptr: *const Context = &main_ctx;

        let thread_ctx = spawn(&stack, move || {
            RAN.with(|r| r.set(true));
            // Safety: `main_ctx_ptr` outlives this switch, which only
            // returns once the test thread below resumes `main_ctx`.
            unsafe { jump_into(&*main_ctx_ptr) }
        });

        // Safety: both contexts are freshly created and used from a single
        // thread, satisfying the switch contract.
        unsafe { switch(&main_ctx, &thread_ctx) };

        RAN.with(|r| assert!(r.get()));
    }
}
