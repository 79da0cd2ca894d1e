//! A hybrid 1:1 / M:N user-space threading runtime.
//!
//! Two thread-mapping disciplines coexist in one process: [`Mapping::OneOne`]
//! threads run under the host kernel scheduler for life, while
//! [`Mapping::ManyMany`] threads are multiplexed cooperatively-over-
//! preemptively across a fixed pool of kernel-backed carriers by an
//! in-process dispatcher. Both share one identifier space and one handle
//! type ([`ThreadHandle`]).
//!
//! Call [`init`] (or [`init_with_config`]) once before creating any
//! ManyMany thread; [`deinit`] tears the runtime down. [`run_main`] does
//! both around a single entry point for the common case of one designated
//! main thread.

mod api;
mod bootstrap;
mod carrier;
mod config;
mod descriptor;
mod error;
mod futex;
mod id;
mod mutex;
mod queue;
mod spinlock;
mod timer;

pub use api::{
    MutexHandle, SpinlockHandle, ThreadHandle, create, current, exit, join, kill, mutex_destroy,
    mutex_init, mutex_lock, mutex_trylock, mutex_unlock, sigmask, spin_destroy, spin_init,
    spin_lock, spin_trylock, spin_unlock, yield_now,
};
pub use bootstrap::{deinit, init, init_with_config, run_main};
pub use config::Config;
pub use descriptor::Mapping;
pub use error::{CreateError, JoinError, KillError, LockError, SigmaskError, Status, last_error};
pub use id::ThreadId;
