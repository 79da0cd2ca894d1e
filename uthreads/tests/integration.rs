//! End-to-end scenarios (§8) run against the real dispatcher and real
//! kernel tasks. Not unit-testable in isolation: every case here needs a
//! live carrier pool.
//!
//! Each `#[test]` function runs on its own fresh kernel task (the Rust test
//! harness's default), which gets transparently adopted as an implicit
//! OneOne thread the moment it calls into the API — see
//! `carrier::current_or_adopt`. That is what lets a test call `create`/
//! `join` directly without first wrapping itself in a `create`d thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uthreads::{Config, Mapping};

fn with_runtime<F, R>(n_carriers: usize, f: F) -> R
where
    F: FnOnce() -> R,
{
    uthreads::init_with_config(Config::with_carriers(n_carriers));
    let ret = f();
    uthreads::deinit();
    ret
}

#[test]
fn return_value_propagation() {
    with_runtime(1, || {
        let h = uthreads::create(Mapping::ManyMany, || 456i32).unwrap();
        let ret = uthreads::join(&h).unwrap();
        assert_eq!(*ret.downcast::<i32>().unwrap(), 456);
    });
}

#[test]
fn mixed_mapping_join() {
    with_runtime(2, || {
        let h1 = uthreads::create(Mapping::OneOne, || 123i32).unwrap();
        let h2 = uthreads::create(Mapping::ManyMany, || 123i32).unwrap();
        let r1 = *uthreads::join(&h1).unwrap().downcast::<i32>().unwrap();
        let r2 = *uthreads::join(&h2).unwrap().downcast::<i32>().unwrap();
        assert_eq!(r1, 123);
        assert_eq!(r2, 123);
    });
}

#[test]
fn mutual_exclusion_under_contention() {
    with_runtime(4, || {
        let mutex = uthreads::mutex_init();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let mutex = mutex.clone();
                let counter = Arc::clone(&counter);
                uthreads::create(Mapping::ManyMany, move || {
                    for _ in 0..10_000 {
                        uthreads::mutex_lock(&mutex);
                        counter.fetch_add(1, Ordering::Relaxed);
                        uthreads::mutex_unlock(&mutex).unwrap();
                    }
                })
                .unwrap()
            })
            .collect();

        for h in &handles {
            uthreads::join(h).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 30_000);
        uthreads::mutex_destroy(mutex);
    });
}

#[test]
fn self_join_is_a_deadlock_error() {
    with_runtime(1, || {
        let h = uthreads::create(Mapping::ManyMany, || {
            let me = uthreads::current();
            let err = uthreads::join(&me).unwrap_err();
            assert!(matches!(err, uthreads::JoinError::SelfJoin));
            assert_eq!(uthreads::last_error(), uthreads::Status::Deadlock);
        })
        .unwrap();
        uthreads::join(&h).unwrap();
    });
}

#[test]
fn second_joiner_is_rejected() {
    with_runtime(2, || {
        let target = uthreads::create(Mapping::ManyMany, || {
            uthreads::yield_now();
            uthreads::yield_now();
        })
        .unwrap();

        let first_joiner_target = target.clone();
        let first = uthreads::create(Mapping::ManyMany, move || {
            uthreads::join(&first_joiner_target)
        })
        .unwrap();

        // Give `first` a chance to register as joiner before we also try.
        std::thread::sleep(std::time::Duration::from_millis(20));

        match uthreads::join(&target) {
            Ok(_) => {
                // We won the race; `first`'s join must then fail.
                uthreads::join(&first).unwrap_err();
            }
            Err(uthreads::JoinError::AlreadyHasJoiner) => {
                uthreads::join(&first).unwrap();
            }
            Err(other) => panic!("unexpected join error: {other}"),
        }
    });
}

#[test]
fn kill_with_handler_that_exits_terminates_the_thread() {
    use std::sync::atomic::AtomicBool;

    static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        SHOULD_EXIT.store(true, Ordering::Release);
    }

    with_runtime(2, || {
        // Safety: installs a plain handler for SIGUSR1; no other test in
        // this binary uses that signal number.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
        }

        let h = uthreads::create(Mapping::ManyMany, || {
            loop {
                if SHOULD_EXIT.load(Ordering::Acquire) {
                    uthreads::exit(Box::new(()));
                }
                uthreads::yield_now();
            }
        })
        .unwrap();

        uthreads::kill(&h, libc::SIGUSR1).unwrap();
        uthreads::join(&h).unwrap();
    });
}

#[test]
fn preemption_cannot_be_blocked_by_user_sigmask() {
    with_runtime(2, || {
        let sibling_progress = Arc::new(AtomicUsize::new(0));
        let sibling_progress_clone = Arc::clone(&sibling_progress);

        let spinner = uthreads::create(Mapping::ManyMany, || {
            // Safety: a fully-set sigset_t is a valid SIG_BLOCK argument.
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigfillset(&mut set);
                uthreads::sigmask(libc::SIG_BLOCK, Some(&set), None).unwrap();
            }
            let deadline = std::time::Instant::now() + std::time::Duration::from_millis(200);
            while std::time::Instant::now() < deadline {
                std::hint::spin_loop();
            }
        })
        .unwrap();

        let sibling = uthreads::create(Mapping::ManyMany, move || {
            for _ in 0..1000 {
                sibling_progress_clone.fetch_add(1, Ordering::Relaxed);
                uthreads::yield_now();
            }
        })
        .unwrap();

        uthreads::join(&spinner).unwrap();
        uthreads::join(&sibling).unwrap();
        assert_eq!(sibling_progress.load(Ordering::Relaxed), 1000);
    });
}

#[test]
fn trylock_on_held_mutex_is_busy_without_blocking() {
    with_runtime(1, || {
        let mutex = uthreads::mutex_init();
        let h = {
            let mutex = mutex.clone();
            uthreads::create(Mapping::ManyMany, move || {
                uthreads::mutex_lock(&mutex);
                uthreads::yield_now();
                uthreads::mutex_unlock(&mutex).unwrap();
            })
            .unwrap()
        };
        uthreads::yield_now();
        let _ = uthreads::mutex_trylock(&mutex);
        uthreads::join(&h).unwrap();
        uthreads::mutex_destroy(mutex);
    });
}

#[test]
fn run_main_adapter_joins_the_main_thread() {
    let ret = uthreads::run_main(2, || 42i32);
    assert_eq!(*ret.downcast::<i32>().unwrap(), 42);
}
