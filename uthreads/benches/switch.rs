use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Once;
use uthreads::{Config, Mapping};

static INIT: Once = Once::new();

/// The runtime is process-global and panics if brought up twice, so every
/// bench function that needs a carrier pool shares this one init call.
fn ensure_runtime() {
    INIT.call_once(|| {
        uthreads::init_with_config(Config::with_carriers(2));
    });
}

/// Cost of one yield-and-redispatch round trip, timed from inside the
/// ManyMany thread doing the yielding so the measurement covers the same
/// save-sigmask/switch/restore path a voluntary mutex wait or join takes.
fn yield_round_trip(c: &mut Criterion) {
    ensure_runtime();

    c.bench_function("many_many_yield_round_trip", |b| {
        b.iter_custom(|iters| {
            let h = uthreads::create(Mapping::ManyMany, move || {
                let start = std::time::Instant::now();
                for _ in 0..iters {
                    black_box(uthreads::yield_now());
                }
                start.elapsed()
            })
            .unwrap();
            *uthreads::join(&h)
                .unwrap()
                .downcast::<std::time::Duration>()
                .unwrap()
        });
    });
}

/// Cost of spawning a ManyMany thread and joining its immediate return.
fn create_join_round_trip(c: &mut Criterion) {
    ensure_runtime();

    c.bench_function("many_many_create_join_round_trip", |b| {
        b.iter(|| {
            let h = uthreads::create(Mapping::ManyMany, || ()).unwrap();
            black_box(uthreads::join(&h).unwrap());
        });
    });
}

/// Uncontended mutex lock/unlock, which never leaves the futex-only fast
/// path since no ManyMany thread touches it here.
fn mutex_uncontended(c: &mut Criterion) {
    let m = uthreads::mutex_init();
    c.bench_function("mutex_uncontended_lock_unlock", |b| {
        b.iter(|| {
            uthreads::mutex_lock(&m);
            uthreads::mutex_unlock(&m).unwrap();
        });
    });
    uthreads::mutex_destroy(m);
}

criterion_group!(
    benches,
    mutex_uncontended,
    create_join_round_trip,
    yield_round_trip
);
criterion_main!(benches);
