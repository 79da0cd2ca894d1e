//! Runtime init/deinit and the main-thread adapter (§4.L).

use crate::config::Config;
use crate::descriptor::Mapping;
use crate::queue::ReadyQueue;
use crate::{api, carrier};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};
use std::thread::JoinHandle;

pub(crate) struct Runtime {
    pub(crate) ready_queue: ReadyQueue,
    pub(crate) scheduling_enabled: AtomicBool,
    pub(crate) config: Config,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static CARRIERS: StdMutex<Vec<JoinHandle<()>>> = StdMutex::new(Vec::new());

pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("uthreads::init was not called")
}

/// Brings up the runtime with `n_carriers` dispatcher loops and the
/// default time slice. See [`init_with_config`] to override the slice too.
pub fn init(n_carriers: usize) {
    init_with_config(Config::with_carriers(n_carriers));
}

/// Brings up the runtime: the ready queue and `config.n_carriers` carrier
/// tasks, each running the dispatcher loop.
///
/// # Panics
///
/// Panics if called more than once in a process.
pub fn init_with_config(config: Config) {
    let n = config.n_carriers.get();
    RUNTIME
        .set(Runtime {
            ready_queue: ReadyQueue::new(),
            scheduling_enabled: AtomicBool::new(true),
            config,
        })
        .unwrap_or_else(|_| panic!("uthreads::init_with_config called more than once"));

    let mut carriers = CARRIERS.lock().expect("carrier list poisoned");
    for _ in 0..n {
        carriers.push(std::thread::spawn(carrier::run));
    }
    tracing::info!(n_carriers = n, "runtime initialized");
}

/// Tears the runtime down.
///
/// Outstanding ManyMany threads are **abandoned**, not drained: clearing
/// the scheduling flag lets every carrier's dispatcher loop exit as soon as
/// it finishes whatever thread it is currently running, and any descriptor
/// still queued or mid-join is simply dropped. This mirrors the original
/// `hybrid` runtime's teardown exactly rather than adding a drain phase it
/// never had.
pub fn deinit() {
    runtime().scheduling_enabled.store(false, Ordering::Release);
    let handles: Vec<_> = CARRIERS
        .lock()
        .expect("carrier list poisoned")
        .drain(..)
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
    tracing::info!("runtime torn down");
}

/// Convenience adapter: brings the runtime up, runs `main_thread` as the
/// first OneOne thread, waits for it to terminate, then tears the runtime
/// down.
pub fn run_main<F, R>(n_carriers: usize, main_thread: F) -> Box<dyn Any + Send>
where
    F: FnOnce() -> R + Send + 'static,
    R: Any + Send + 'static,
{
    init(n_carriers);
    let handle =
        api::create(Mapping::OneOne, main_thread).expect("failed to create the main thread");
    let ret = api::join(&handle).expect("the main thread cannot deadlock against itself");
    deinit();
    ret
}
